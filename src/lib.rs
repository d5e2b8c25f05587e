// Core library for the logpipe batching pipeline

pub mod cli;
pub mod config;
pub mod config_file;
pub mod error;
pub mod logging;
pub mod parallel;
pub mod platform;
pub mod processors;
pub mod stats;

pub use config::{PipelineConfig, PipelineSettings};
pub use error::{PipelineError, Result};
pub use parallel::{
    run, Batch, BatchProcessor, BatchResult, Drain, ErrorKind, Outcome, Pipeline, PipelineState,
    ProcessError, Record, ResultFormat, StopReport,
};
pub use stats::PipelineStats;
