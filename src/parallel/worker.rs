//! Worker threads for parallel processing
//!
//! Each worker pulls one batch at a time from the shared batch queue,
//! runs the processing function on it and records the outcome with the
//! completion tracker. Processing errors and panics are confined to the
//! batch that caused them.

use crossbeam_channel::Receiver;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::stats::{PipelineStats, StatsCollector};

use super::tracker::CompletionTracker;
use super::types::{Batch, BatchResult, ErrorKind, Outcome};

/// Error returned by a processing function for one batch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessError {
    pub message: String,
    /// Sequence numbers of the records that failed; empty means all of them
    pub failed: Vec<u64>,
}

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failed: Vec::new(),
        }
    }

    pub fn with_failed(mut self, failed: Vec<u64>) -> Self {
        self.failed = failed;
        self
    }
}

/// Processing function applied to every batch.
///
/// Returns the number of records processed. Implemented for any
/// `Fn(&Batch<T>) -> Result<usize, ProcessError>` closure.
pub trait BatchProcessor<T>: Send + Sync {
    fn process(&self, batch: &Batch<T>) -> std::result::Result<usize, ProcessError>;
}

impl<T, F> BatchProcessor<T> for F
where
    F: Fn(&Batch<T>) -> std::result::Result<usize, ProcessError> + Send + Sync,
{
    fn process(&self, batch: &Batch<T>) -> std::result::Result<usize, ProcessError> {
        self(batch)
    }
}

/// Fixed-size pool of worker threads
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers pulling from `batch_receiver`.
    pub fn start<T: Send + 'static>(
        concurrency: usize,
        batch_receiver: Receiver<Batch<T>>,
        tracker: Arc<CompletionTracker>,
        processor: Arc<dyn BatchProcessor<T>>,
        stats: StatsCollector,
    ) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(concurrency);

        for worker_id in 0..concurrency.max(1) {
            let ctx = WorkerContext {
                worker_id,
                batch_receiver: batch_receiver.clone(),
                tracker: Arc::clone(&tracker),
                processor: Arc::clone(&processor),
                stats: stats.clone(),
                cancel: Arc::clone(&cancel),
            };
            let handle = thread::Builder::new()
                .name(format!("logpipe-worker-{}", worker_id))
                .spawn(move || worker_thread(ctx));

            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Workers already running exit once the queue closes
                    cancel.store(true, Ordering::Release);
                    return Err(PipelineError::Spawn("worker", e));
                }
            }
        }

        debug!(workers = handles.len(), "worker pool started");
        Ok(Self { handles, cancel })
    }

    /// Stop taking new batches; batches already being processed finish.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }

    /// Wait for every worker to exit
    pub fn join(self) {
        for (idx, handle) in self.handles.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!(worker = idx, "worker thread panicked outside batch processing");
            }
        }
    }
}

struct WorkerContext<T> {
    worker_id: usize,
    batch_receiver: Receiver<Batch<T>>,
    tracker: Arc<CompletionTracker>,
    processor: Arc<dyn BatchProcessor<T>>,
    stats: StatsCollector,
    cancel: Arc<AtomicBool>,
}

/// Worker thread: processes batches until the queue closes or the pool is cancelled
fn worker_thread<T>(ctx: WorkerContext<T>) {
    while let Ok(batch) = ctx.batch_receiver.recv() {
        if ctx.cancel.load(Ordering::Acquire) {
            debug!(worker = ctx.worker_id, batch = batch.index, "pool cancelled, leaving batch");
            break;
        }

        // Waits while the consumer is a full window behind
        if !ctx.tracker.admit(batch.index) {
            debug!(worker = ctx.worker_id, batch = batch.index, "batch already resolved, skipping");
            continue;
        }

        let (result, panicked) = process_batch(ctx.worker_id, &batch, ctx.processor.as_ref());
        let delta = result_stats(&result, panicked);

        if ctx.tracker.record(result) {
            ctx.stats.merge(&delta);
        } else {
            ctx.stats.merge(&PipelineStats {
                discarded_results: 1,
                ..Default::default()
            });
        }
    }
    debug!(worker = ctx.worker_id, "worker exiting");
}

/// Run the processor on one batch, turning errors and panics into a failure result
fn process_batch<T>(
    worker_id: usize,
    batch: &Batch<T>,
    processor: &dyn BatchProcessor<T>,
) -> (BatchResult, bool) {
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(batch)));

    match outcome {
        Ok(Ok(processed)) => {
            debug!(
                worker = worker_id,
                batch = batch.index,
                processed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "batch processed"
            );
            (BatchResult::success(batch.index, batch.len(), processed), false)
        }
        Ok(Err(err)) => {
            warn!(worker = worker_id, batch = batch.index, error = %err, "batch processing failed");
            let failed = if err.failed.is_empty() {
                batch.seqs()
            } else {
                err.failed
            };
            let result = BatchResult::failure(
                batch.index,
                batch.len(),
                ErrorKind::WorkerFault,
                failed,
                err.message,
            );
            (result, false)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(worker = worker_id, batch = batch.index, panic = %message, "worker panicked while processing batch");
            let result = BatchResult::failure(
                batch.index,
                batch.len(),
                ErrorKind::WorkerFault,
                batch.seqs(),
                format!("processing panicked: {}", message),
            );
            (result, true)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn result_stats(result: &BatchResult, panicked: bool) -> PipelineStats {
    let mut delta = PipelineStats::default();
    match &result.outcome {
        Outcome::Success { processed } => {
            delta.batches_succeeded = 1;
            delta.records_processed = *processed as u64;
        }
        Outcome::Failure { kind, failed, .. } => {
            delta.batches_failed = 1;
            delta.records_failed = failed.len() as u64;
            delta.records_processed = result.records.saturating_sub(failed.len()) as u64;
            if *kind == ErrorKind::WorkerFault {
                delta.worker_faults = 1;
            }
        }
    }
    if panicked {
        delta.panics = 1;
    }
    delta
}
