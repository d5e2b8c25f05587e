//! Batcher thread logic for parallel processing
//!
//! Groups submitted records into batches by size or by age of the
//! oldest record in the open batch, and hands them to the batch queue.

use chrono::Utc;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::error::{PipelineError, Result};
use crate::stats::StatsCollector;

use super::tracker::CompletionTracker;
use super::types::{Batch, BatcherConfig, Record};

/// Control messages for the batcher thread
#[derive(Debug)]
enum BatcherCtrl {
    Flush,
}

/// Why a batch could not be handed to the batch queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    /// Every worker has gone away
    Disconnected,
    /// The batcher was cancelled while waiting for queue space
    Cancelled,
}

/// Front end of the single batcher thread.
///
/// `submit` may be called from any number of threads. Sequence numbers
/// are assigned by the batcher thread in arrival order, so records keep
/// submission order within and across batches.
pub struct Batcher<T> {
    record_sender: Mutex<Option<Sender<T>>>,
    ctrl_sender: Sender<BatcherCtrl>,
    /// Dropped to cancel the batcher thread
    cancel_sender: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<u64>>>,
    emitted: Arc<AtomicU64>,
}

impl<T: Send + 'static> Batcher<T> {
    /// Start the batcher thread, emitting batches into `batch_sender`.
    ///
    /// When a tracker is supplied every batch is registered with it
    /// before being queued, and the final batch count is declared when
    /// the batcher finishes.
    pub fn spawn(
        config: BatcherConfig,
        batch_sender: Sender<Batch<T>>,
        tracker: Option<Arc<CompletionTracker>>,
        stats: StatsCollector,
    ) -> Result<Self> {
        let (record_sender, record_receiver) = bounded(config.batch_size.max(1));
        let (ctrl_sender, ctrl_receiver) = bounded(4);
        let (cancel_sender, cancel_receiver) = bounded::<()>(0);
        let emitted = Arc::new(AtomicU64::new(0));

        let emitter = Emitter {
            batch_sender,
            cancel_receiver,
            cancelled: false,
            tracker,
            stats,
            batch_size: config.batch_size.max(1),
            next_index: 0,
            emitted: Arc::clone(&emitted),
        };

        let handle = thread::Builder::new()
            .name("logpipe-batcher".to_string())
            .spawn(move || batcher_thread(record_receiver, ctrl_receiver, emitter, config))
            .map_err(|e| PipelineError::Spawn("batcher", e))?;

        Ok(Self {
            record_sender: Mutex::new(Some(record_sender)),
            ctrl_sender,
            cancel_sender: Mutex::new(Some(cancel_sender)),
            handle: Mutex::new(Some(handle)),
            emitted,
        })
    }
}

impl<T> Batcher<T> {
    fn lock_sender(&self) -> MutexGuard<'_, Option<Sender<T>>> {
        self.record_sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand a record to the batcher.
    ///
    /// Blocks while the batcher is stalled on a full batch queue. Fails
    /// with [`PipelineError::Closed`] once the batcher has been flushed
    /// or closed.
    pub fn submit(&self, payload: T) -> Result<()> {
        let sender = self.lock_sender().clone().ok_or(PipelineError::Closed)?;
        sender.send(payload).map_err(|_| PipelineError::Closed)
    }

    /// Seal the batcher and push the open partial batch out now.
    ///
    /// Records from submits already in progress are still batched;
    /// later submits fail with `Closed`.
    pub fn flush(&self) {
        let sealed = self.lock_sender().take();
        if sealed.is_some() {
            debug!("batcher sealed");
        }
        drop(sealed);
        match self.ctrl_sender.try_send(BatcherCtrl::Flush) {
            Ok(()) => {}
            // Earlier flushes are still queued and will push the batch out
            Err(TrySendError::Full(_)) => debug!("flush already pending"),
            Err(TrySendError::Disconnected(_)) => {
                if !self.is_finished() {
                    warn!("batcher control channel closed while the batcher is running");
                }
            }
        }
    }

    /// Seal the batcher and stop feeding the batch queue.
    ///
    /// A batch waiting for queue space is abandoned. Records accepted
    /// by `submit`, including those from submits blocked at the time of
    /// the call, are still grouped into batches and registered with the
    /// tracker, but never queued. Follow with [`close`](Self::close) to
    /// wait for that to finish.
    pub fn cancel(&self) {
        drop(self.lock_sender().take());
        let cancel = self
            .cancel_sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if cancel.is_some() {
            debug!("batcher cancelled");
        }
    }

    /// Flush, then wait until every batch has been queued and the batch
    /// queue has been released. Returns the number of batches emitted.
    ///
    /// Blocks for as long as the batch queue stays full.
    pub fn close(&self) -> u64 {
        self.flush();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match handle {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| self.emitted.load(Ordering::Acquire)),
            None => self.emitted.load(Ordering::Acquire),
        }
    }

    /// Whether `flush` or `close` has been called
    pub fn is_sealed(&self) -> bool {
        self.lock_sender().is_none()
    }

    /// Batches emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Acquire)
    }

    /// Whether the batcher thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }
}

/// Owns the outgoing side of the batcher: index assignment, tracker
/// registration and the (blocking) send into the batch queue.
struct Emitter<T> {
    batch_sender: Sender<Batch<T>>,
    cancel_receiver: Receiver<()>,
    /// Once set, batches are registered but no longer queued
    cancelled: bool,
    tracker: Option<Arc<CompletionTracker>>,
    stats: StatsCollector,
    batch_size: usize,
    next_index: u64,
    emitted: Arc<AtomicU64>,
}

impl<T> Emitter<T> {
    fn emit(&mut self, current: &mut Vec<Record<T>>) -> std::result::Result<(), Halt> {
        if current.is_empty() {
            return Ok(());
        }

        let records = std::mem::replace(current, Vec::with_capacity(self.batch_size));
        let batch = Batch {
            index: self.next_index,
            records,
            created_at: Utc::now(),
        };

        if let Some(tracker) = &self.tracker {
            tracker.register(batch.index, batch.seqs());
        }
        self.stats.add_batch_emitted(batch.len());
        self.next_index += 1;
        self.emitted.store(self.next_index, Ordering::Release);

        if self.cancelled {
            debug!(batch = batch.index, records = batch.len(), "registering batch after cancel");
            return Ok(());
        }

        debug!(batch = batch.index, records = batch.len(), "emitting batch");
        let sent = select! {
            send(self.batch_sender, batch) -> sent => sent.map_err(|_| Halt::Disconnected),
            recv(self.cancel_receiver) -> _ => Err(Halt::Cancelled),
        };
        if sent == Err(Halt::Cancelled) {
            debug!(batch = self.next_index - 1, "batch abandoned by cancel");
            self.cancelled = true;
        }
        sent
    }

    fn finish(&self) {
        if let Some(tracker) = &self.tracker {
            tracker.set_total(self.next_index);
        }
        debug!(batches = self.next_index, "batcher finished");
    }
}

/// Batcher thread - collects records into batches for the worker pool
fn batcher_thread<T>(
    record_receiver: Receiver<T>,
    ctrl_receiver: Receiver<BatcherCtrl>,
    mut emitter: Emitter<T>,
    config: BatcherConfig,
) -> u64 {
    let mut ctrl_receiver = ctrl_receiver;
    let cancel_receiver = emitter.cancel_receiver.clone();
    let mut ctrl_disconnected = false;
    let mut current = Vec::with_capacity(emitter.batch_size);
    let mut next_seq = 0u64;
    let mut pending_deadline: Option<Instant> = None;

    let mut push = |current: &mut Vec<Record<T>>, payload: T, deadline: &mut Option<Instant>| {
        if current.is_empty() {
            *deadline = Some(Instant::now() + config.batch_timeout);
        }
        trace!(seq = next_seq, "record received");
        current.push(Record {
            seq: next_seq,
            payload,
            ingested_at: Utc::now(),
        });
        next_seq += 1;
    };

    'outer: loop {
        let timeout = match pending_deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        };

        select! {
            recv(record_receiver) -> msg => {
                match msg {
                    Ok(payload) => {
                        push(&mut current, payload, &mut pending_deadline);
                        if current.len() >= emitter.batch_size {
                            pending_deadline = None;
                            if emitter.emit(&mut current).is_err() {
                                break 'outer;
                            }
                        }
                    }
                    // Every sender is gone: sealed and no submit in progress
                    Err(_) => break 'outer,
                }
            }
            recv(ctrl_receiver) -> msg => {
                match msg {
                    Ok(BatcherCtrl::Flush) => {
                        while let Ok(payload) = record_receiver.try_recv() {
                            push(&mut current, payload, &mut pending_deadline);
                            if current.len() >= emitter.batch_size
                                && emitter.emit(&mut current).is_err()
                            {
                                break 'outer;
                            }
                        }
                        pending_deadline = None;
                        if emitter.emit(&mut current).is_err() {
                            break 'outer;
                        }
                    }
                    Err(_) => ctrl_disconnected = true,
                }
            }
            recv(timeout) -> _ => {
                pending_deadline = None;
                if emitter.emit(&mut current).is_err() {
                    break 'outer;
                }
            }
            recv(cancel_receiver) -> _ => {
                emitter.cancelled = true;
                break 'outer;
            }
        }

        if ctrl_disconnected {
            ctrl_receiver = crossbeam_channel::never();
            ctrl_disconnected = false;
        }
    }

    if emitter.cancelled {
        // Keep receiving until every in-progress submit has delivered its
        // record, so nothing accepted goes unaccounted for
        for payload in record_receiver.iter() {
            push(&mut current, payload, &mut pending_deadline);
            if current.len() >= emitter.batch_size {
                let _ = emitter.emit(&mut current);
            }
        }
    }

    // A failed send leaves nothing to flush into; otherwise emit the tail
    if !current.is_empty() && emitter.emit(&mut current).is_err() {
        debug!("batch queue closed before the final batch could be queued");
    }
    emitter.finish();
    emitter.next_index
}
