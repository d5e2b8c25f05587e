// tests/common/mod.rs
// Shared test utilities for integration tests
#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use tempfile::{NamedTempFile, TempDir};

pub fn logpipe_binary() -> &'static str {
    env!("CARGO_BIN_EXE_logpipe")
}

/// Command for the built binary with user config discovery pointed at
/// an empty directory, so a developer's own config cannot leak in.
pub fn logpipe_command(home: &Path) -> Command {
    let mut cmd = Command::new(logpipe_binary());
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env_remove("RUST_LOG");
    cmd
}

fn split_output(output: Output) -> (String, String, i32) {
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code().unwrap_or(-1),
    )
}

/// Run logpipe with given arguments and input via stdin
pub fn run_logpipe_with_input(args: &[&str], input: &str) -> (String, String, i32) {
    let home = TempDir::new().expect("Failed to create temp home");
    let mut child = logpipe_command(home.path())
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to start logpipe");

    if let Some(mut stdin) = child.stdin.take() {
        // The process may exit before reading stdin (e.g. on a usage error).
        if let Err(e) = stdin.write_all(input.as_bytes()) {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                panic!("Failed to write to stdin: {e}");
            }
        }
    }

    split_output(child.wait_with_output().expect("Failed to read output"))
}

/// Run logpipe with a temporary input file appended to the arguments
pub fn run_logpipe_with_file(args: &[&str], file_content: &str) -> (String, String, i32) {
    let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
    temp_file
        .write_all(file_content.as_bytes())
        .expect("Failed to write to temp file");

    let path = temp_file.path().to_str().expect("temp path is UTF-8");
    let mut full_args = args.to_vec();
    full_args.push(path);

    let home = TempDir::new().expect("Failed to create temp home");
    let output = logpipe_command(home.path())
        .args(&full_args)
        .stdin(Stdio::null())
        .output()
        .expect("Failed to execute logpipe");
    split_output(output)
}

/// Spawn logpipe reading from a stdin pipe that the caller controls
pub fn spawn_logpipe(args: &[&str], home: &Path) -> Child {
    logpipe_command(home)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to start logpipe")
}

/// `count` input lines of JSON
pub fn json_lines(count: usize) -> String {
    (0..count)
        .map(|i| format!("{{\"n\":{}}}\n", i))
        .collect()
}

/// Batch indices of JSON result lines, in output order
pub fn result_indices(stdout: &str) -> Vec<u64> {
    stdout
        .lines()
        .map(|line| {
            let value: serde_json::Value =
                serde_json::from_str(line).expect("result line should be JSON");
            value["index"].as_u64().expect("result has an index")
        })
        .collect()
}
