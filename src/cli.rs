// CLI-specific types and structures
// This module contains the command-line interface definitions

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::PipelineSettings;
use crate::parallel::ResultFormat;
use crate::processors::ProcessorKind;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One human-readable line per batch
    #[default]
    Text,
    /// One JSON object per batch
    Json,
}

impl From<OutputFormat> for ResultFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => ResultFormat::Text,
            OutputFormat::Json => ResultFormat::Json,
        }
    }
}

// CLI structure - contains all command-line arguments and options
#[derive(Parser, Debug)]
#[command(name = "logpipe")]
#[command(about = "Batch log records and process them on a bounded worker pool")]
#[command(
    long_about = "Batch log records and process them on a bounded worker pool\n\nLines are grouped into batches by size or age, processed in parallel, and\nreported one result per batch in batch order.\n\nEXAMPLES:\n  logpipe app.log --processor json --stats\n  tail -f app.log | logpipe --batch-size 100 --batch-timeout 50ms\n  logpipe --output json --threads 4 a.log b.log"
)]
#[command(version)]
#[command(args_override_self = true)]
pub struct Cli {
    /// Input files (stdin if not specified, or use "-" to explicitly specify stdin)
    pub files: Vec<String>,

    /// Processing applied to each batch
    #[arg(
        short = 'p',
        long = "processor",
        value_enum,
        default_value_t = ProcessorKind::Count,
        help_heading = "Processing Options"
    )]
    pub processor: ProcessorKind,

    /// Result output format
    #[arg(
        short = 'o',
        long = "output",
        value_enum,
        default_value_t = OutputFormat::Text,
        help_heading = "Output Options"
    )]
    pub output: OutputFormat,

    /// Suppress start/close messages and warnings
    #[arg(short = 'q', long = "quiet", help_heading = "Output Options")]
    pub quiet: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output Options")]
    pub verbose: u8,

    /// Print pipeline statistics to stderr when done
    #[arg(short = 's', long = "stats", help_heading = "Output Options")]
    pub stats: bool,

    /// Maximum records per batch
    #[arg(long = "batch-size", help_heading = "Performance Options")]
    pub batch_size: Option<usize>,

    /// Emit a partial batch after this long (e.g. 200ms, 1s)
    #[arg(
        long = "batch-timeout",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Performance Options"
    )]
    pub batch_timeout: Option<Duration>,

    /// Number of worker threads (default: number of CPUs)
    #[arg(long = "threads", help_heading = "Performance Options")]
    pub threads: Option<usize>,

    /// Batches allowed to wait for a worker before input blocks
    #[arg(long = "queue-capacity", help_heading = "Performance Options")]
    pub queue_capacity: Option<usize>,

    /// How long to wait for in-flight batches when stopping
    #[arg(
        long = "shutdown-timeout",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Performance Options"
    )]
    pub shutdown_timeout: Option<Duration>,

    /// Specify custom configuration file path
    #[arg(long = "config-file", visible_alias = "config", help_heading = "Configuration Options")]
    pub config_file: Option<PathBuf>,

    /// Ignore configuration files
    #[arg(long = "ignore-config", help_heading = "Configuration Options")]
    pub ignore_config: bool,

    /// Show configuration file locations and effective settings, then exit
    #[arg(long = "show-config", help_heading = "Configuration Options")]
    pub show_config: bool,
}

impl Cli {
    /// Pipeline settings given explicitly on the command line
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            batch_max_size: self.batch_size,
            batch_max_wait: self.batch_timeout,
            concurrency: self.threads,
            queue_capacity: self.queue_capacity,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    /// Default tracing filter for the chosen verbosity
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    }
}
