use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use logpipe::cli::Cli;
use logpipe::config::{PipelineConfig, PipelineSettings};
use logpipe::config_file::ConfigFile;
use logpipe::logging::init_logging;
use logpipe::parallel::{write_results, Pipeline, ResultFormat, SinkSummary};
use logpipe::platform::{termination_exit_code, Ctrl, ExitCode, SafeStdout, SignalHandler};
use logpipe::PipelineError;

type Input = Box<dyn BufRead + Send>;

/// What the reader thread reports when it is done
#[derive(Debug)]
enum ReaderOutcome {
    /// All input was read; number of lines submitted
    Eof(u64),
    /// The pipeline stopped accepting records
    Rejected(u64),
    Failed(anyhow::Error),
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_level()) {
        eprintln!("logpipe: {:#}", e);
    }

    if cli.show_config {
        ConfigFile::show_config(cli.config_file.as_deref(), &cli.settings());
        ExitCode::Success.exit();
    }

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("logpipe: Error: {:#}", e);
            ExitCode::GeneralError
        }
    };
    code.exit()
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = match resolve_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("logpipe: Error: {:#}", e);
            return Ok(ExitCode::InvalidUsage);
        }
    };
    let inputs = open_inputs(&cli.files)?;

    let (ctrl_tx, ctrl_rx) = unbounded::<Ctrl>();
    let _signal_handler =
        SignalHandler::new(ctrl_tx).context("failed to initialize signal handling")?;

    let pipeline = Arc::new(Pipeline::with_processor(config, cli.processor.build())?);
    pipeline.start()?;
    if !cli.quiet {
        let config = pipeline.config();
        eprintln!(
            "logpipe: pipeline started ({} workers, batch size {}, batch timeout {})",
            config.concurrency,
            config.batch_max_size,
            humantime::format_duration(config.batch_max_wait)
        );
    }

    let drain = pipeline.drain();
    let format: ResultFormat = cli.output.into();
    let sink = thread::Builder::new()
        .name("logpipe-sink".to_string())
        .spawn(move || write_results(drain, &mut SafeStdout::new(), format))
        .context("failed to spawn sink thread")?;

    let (done_tx, done_rx) = bounded(1);
    spawn_reader(inputs, Arc::clone(&pipeline), done_tx)?;

    let reader_error = wait_for_input(&done_rx, &ctrl_rx);

    let report = pipeline.stop()?;
    let summary: SinkSummary = match sink.join() {
        Ok(summary) => summary?,
        Err(_) => anyhow::bail!("sink thread panicked"),
    };

    if !cli.quiet {
        eprintln!(
            "logpipe: pipeline stopped ({} batches, {} failed, {} records in {})",
            summary.batches,
            summary.failed_batches,
            summary.records,
            humantime::format_duration(round_to_millis(report.elapsed))
        );
    }
    if report.timed_out {
        warn!(
            batches = ?report.forced,
            "batches were still in flight when the shutdown timeout elapsed"
        );
    }
    if cli.stats {
        eprintln!("{}", pipeline.stats().format_stats());
    }

    if let Some(code) = termination_exit_code() {
        return Ok(code);
    }
    if let Some(e) = reader_error {
        eprintln!("logpipe: Error: {:#}", e);
        return Ok(ExitCode::GeneralError);
    }
    if summary.failed_batches > 0 {
        return Ok(ExitCode::GeneralError);
    }
    Ok(ExitCode::Success)
}

/// CLI > project file > user file > defaults
fn resolve_config(cli: &Cli) -> Result<PipelineConfig> {
    let file_settings = if cli.ignore_config {
        PipelineSettings::default()
    } else {
        ConfigFile::load_with_custom_path(cli.config_file.as_deref())?.pipeline
    };
    let settings = PipelineSettings::merge(file_settings, cli.settings());
    let config = PipelineConfig::default().with_settings(&settings);
    config.validate()?;
    debug!(?config, "resolved pipeline configuration");
    Ok(config)
}

fn open_inputs(files: &[String]) -> Result<Vec<Input>> {
    if files.is_empty() {
        return Ok(vec![Box::new(BufReader::new(io::stdin()))]);
    }
    files
        .iter()
        .map(|path| -> Result<Input> {
            if path == "-" {
                return Ok(Box::new(BufReader::new(io::stdin())));
            }
            let file =
                File::open(path).with_context(|| format!("failed to open input file '{}'", path))?;
            Ok(Box::new(BufReader::new(file)))
        })
        .collect()
}

/// Read lines from every input in turn and submit them.
///
/// The thread is never joined: on a signal it may be blocked reading
/// stdin, and the process exits once the pipeline has drained.
fn spawn_reader(
    inputs: Vec<Input>,
    pipeline: Arc<Pipeline<String>>,
    done: Sender<ReaderOutcome>,
) -> Result<()> {
    thread::Builder::new()
        .name("logpipe-reader".to_string())
        .spawn(move || {
            let outcome = read_inputs(inputs, &pipeline);
            let _ = done.send(outcome);
        })
        .context("failed to spawn reader thread")?;
    Ok(())
}

fn read_inputs(inputs: Vec<Input>, pipeline: &Pipeline<String>) -> ReaderOutcome {
    let mut submitted = 0u64;
    let mut buffer = String::new();

    for mut reader in inputs {
        loop {
            if SignalHandler::should_terminate() {
                return ReaderOutcome::Eof(submitted);
            }

            buffer.clear();
            match reader.read_line(&mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    let line = buffer.trim_end_matches(&['\n', '\r'][..]).to_string();
                    match pipeline.submit(line) {
                        Ok(()) => submitted += 1,
                        Err(PipelineError::NotRunning(state)) => {
                            debug!(%state, "pipeline no longer accepting input");
                            return ReaderOutcome::Rejected(submitted);
                        }
                        Err(e) => return ReaderOutcome::Failed(e.into()),
                    }
                }
                Err(e) => {
                    let error = anyhow::Error::new(e).context("failed to read input");
                    return ReaderOutcome::Failed(error);
                }
            }
        }
    }
    ReaderOutcome::Eof(submitted)
}

/// Block until input is exhausted or a shutdown signal arrives
fn wait_for_input(done: &Receiver<ReaderOutcome>, ctrl: &Receiver<Ctrl>) -> Option<anyhow::Error> {
    select! {
        recv(done) -> outcome => match outcome {
            Ok(ReaderOutcome::Eof(lines)) | Ok(ReaderOutcome::Rejected(lines)) => {
                debug!(lines, "input finished");
                None
            }
            Ok(ReaderOutcome::Failed(e)) => Some(e),
            Err(_) => Some(anyhow::anyhow!("reader thread exited unexpectedly")),
        },
        recv(ctrl) -> msg => {
            if let Ok(Ctrl::Shutdown { immediate }) = msg {
                debug!(immediate, "shutdown requested, draining pipeline");
            }
            None
        },
    }
}

fn round_to_millis(elapsed: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(elapsed.as_millis() as u64)
}
