use anyhow::Result;
use crossbeam_channel::Sender;
use std::io::{self, Write};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;

use tracing::{debug, warn};

#[cfg(unix)]
use signal_hook::{consts::SIGINT, consts::SIGPIPE, consts::SIGTERM, iterator::Signals};

#[cfg(windows)]
use signal_hook::{consts::SIGINT, flag};

/// Standard Unix exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    InvalidUsage = 2,
    SignalInt = 130,  // 128 + SIGINT (2)
    SignalPipe = 141, // 128 + SIGPIPE (13)
    SignalTerm = 143, // 128 + SIGTERM (15)
}

impl ExitCode {
    pub fn exit(self) -> ! {
        process::exit(self as i32)
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Global termination flag for graceful shutdown
pub static SHOULD_TERMINATE: AtomicBool = AtomicBool::new(false);
/// Exit code of the signal that requested termination, 0 if none
static TERMINATING_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Control messages broadcast by the signal handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ctrl {
    /// Stop reading input and drain; `immediate` on a repeated signal
    Shutdown { immediate: bool },
}

fn request_termination(code: ExitCode) {
    SHOULD_TERMINATE.store(true, Ordering::Relaxed);
    let _ = TERMINATING_SIGNAL.compare_exchange(
        0,
        code.code(),
        Ordering::Relaxed,
        Ordering::Relaxed,
    );
}

/// Exit code for the signal that stopped the run, if any
pub fn termination_exit_code() -> Option<ExitCode> {
    match TERMINATING_SIGNAL.load(Ordering::Relaxed) {
        130 => Some(ExitCode::SignalInt),
        143 => Some(ExitCode::SignalTerm),
        _ => None,
    }
}

/// Signal handler for graceful shutdown
pub struct SignalHandler {
    _handle: thread::JoinHandle<()>,
}

impl SignalHandler {
    /// Install handlers for SIGINT/SIGTERM (and SIGPIPE on Unix).
    ///
    /// The first signal sends `Ctrl::Shutdown` so the pipeline can drain;
    /// a second one exits immediately.
    pub fn new(ctrl_sender: Sender<Ctrl>) -> Result<Self> {
        #[cfg(unix)]
        {
            let mut signals = Signals::new([SIGINT, SIGPIPE, SIGTERM])?;

            let handle = thread::Builder::new()
                .name("logpipe-signals".to_string())
                .spawn(move || {
                    let mut shutdown_count = 0;
                    for sig in signals.forever() {
                        let code = match sig {
                            SIGINT => ExitCode::SignalInt,
                            SIGTERM => ExitCode::SignalTerm,
                            SIGPIPE => {
                                // Broken pipe - exit quietly (normal for Unix pipes)
                                request_termination(ExitCode::SignalPipe);
                                ExitCode::SignalPipe.exit();
                            }
                            other => {
                                warn!(signal = other, "received unexpected signal");
                                continue;
                            }
                        };

                        request_termination(code);
                        shutdown_count += 1;
                        let immediate = shutdown_count > 1;
                        debug!(signal = sig, immediate, "shutdown requested");
                        let _ = ctrl_sender.send(Ctrl::Shutdown { immediate });
                        if immediate {
                            code.exit();
                        }
                    }
                })?;

            Ok(SignalHandler { _handle: handle })
        }

        #[cfg(windows)]
        {
            let term_flag = std::sync::Arc::new(AtomicBool::new(false));
            flag::register(SIGINT, std::sync::Arc::clone(&term_flag))?;

            let handle = thread::Builder::new()
                .name("logpipe-signals".to_string())
                .spawn(move || {
                    let mut shutdown_count = 0;
                    loop {
                        thread::sleep(std::time::Duration::from_millis(100));
                        if term_flag.swap(false, Ordering::Relaxed) {
                            request_termination(ExitCode::SignalInt);
                            shutdown_count += 1;
                            let immediate = shutdown_count > 1;
                            let _ = ctrl_sender.send(Ctrl::Shutdown { immediate });
                            if immediate {
                                ExitCode::SignalInt.exit();
                            }
                        }
                    }
                })?;

            Ok(SignalHandler { _handle: handle })
        }
    }

    /// Check if we should terminate processing
    pub fn should_terminate() -> bool {
        SHOULD_TERMINATE.load(Ordering::Relaxed)
    }
}

/// Stdout writer that exits quietly when the reading end of a pipe goes away
pub struct SafeStdout {
    stdout: io::Stdout,
}

impl Default for SafeStdout {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeStdout {
    pub fn new() -> Self {
        Self {
            stdout: io::stdout(),
        }
    }

    fn check(result: io::Result<()>) -> io::Result<()> {
        match result {
            Err(e) if Self::is_broken_pipe(&e) => ExitCode::SignalPipe.exit(),
            other => other,
        }
    }

    /// Cross-platform broken pipe detection
    fn is_broken_pipe(e: &io::Error) -> bool {
        #[cfg(unix)]
        {
            e.kind() == io::ErrorKind::BrokenPipe
        }

        #[cfg(windows)]
        {
            e.kind() == io::ErrorKind::BrokenPipe
                || e.raw_os_error() == Some(232) // ERROR_NO_DATA
                || e.raw_os_error() == Some(109) // ERROR_BROKEN_PIPE
        }
    }
}

impl Write for SafeStdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdout.write(buf) {
            Err(e) if Self::is_broken_pipe(&e) => ExitCode::SignalPipe.exit(),
            other => other,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Self::check(self.stdout.flush())
    }
}
