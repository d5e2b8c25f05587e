//! Error types for the pipeline core.
//!
//! Structural misuse (writing after close, operating outside `Running`)
//! is reported synchronously through [`PipelineError`]. Per-batch
//! failures never surface here; they travel as
//! [`Outcome::Failure`](crate::parallel::Outcome) results instead.

use thiserror::Error;

use crate::parallel::PipelineState;

/// Errors returned by pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A record was submitted after the batcher was flushed or closed
    #[error("batcher is closed; no further records are accepted")]
    Closed,

    /// An operation that requires a running pipeline was attempted in another state
    #[error("pipeline is not running (state: {0})")]
    NotRunning(PipelineState),

    /// `start()` was called on a pipeline that already left `Created`
    #[error("pipeline has already been started (state: {0})")]
    AlreadyStarted(PipelineState),

    /// Configuration values failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pipeline thread could not be spawned
    #[error("failed to spawn {0} thread")]
    Spawn(&'static str, #[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
