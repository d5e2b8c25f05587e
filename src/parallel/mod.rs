//! Parallel batching pipeline
//!
//! Records are grouped into batches, processed on a bounded pool of
//! worker threads and reported back one result per batch, in batch
//! order.
//!
//! # Module Structure
//!
//! - `types`: Records, batches, results and the lifecycle state
//! - `batching`: The single batcher thread (size and time triggers)
//! - `worker`: Worker pool and the `BatchProcessor` trait
//! - `tracker`: Reordering of out-of-order results and shutdown accounting
//! - `sink`: Ordered result stream and output formatting
//! - `processor`: The `Pipeline` controller

mod batching;
mod processor;
mod sink;
mod tracker;
mod types;
mod worker;

pub use batching::Batcher;
pub use processor::{run, Pipeline};
pub use sink::{format_result, write_results, Drain, ResultFormat, SinkSummary};
pub use tracker::CompletionTracker;
pub use types::{
    Batch, BatchResult, BatcherConfig, ErrorKind, Outcome, PipelineState, Record, StopReport,
};
pub use worker::{BatchProcessor, ProcessError, WorkerPool};
