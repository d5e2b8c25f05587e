//! Completion tracking for parallel processing
//!
//! Workers finish batches out of order. The [`CompletionTracker`] buffers
//! results keyed by batch index and releases the contiguous run starting
//! at the next expected index, so consumers always observe results in
//! strictly increasing index order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, warn};

use super::sink::Drain;
use super::types::{BatchResult, ErrorKind};

#[derive(Debug, Default)]
struct TrackerState {
    /// Results that arrived ahead of `next_release`
    pending: HashMap<u64, BatchResult>,
    /// Released, in order, not yet handed to a consumer
    ready: VecDeque<BatchResult>,
    /// Emitted batches without a result yet: index -> record seqs
    in_flight: BTreeMap<u64, Vec<u64>>,
    registered: u64,
    next_release: u64,
    yielded: u64,
    total: Option<u64>,
    closed: bool,
    discarded: u64,
    forced_records: u64,
}

impl TrackerState {
    fn release_ready(&mut self) {
        while let Some(result) = self.pending.remove(&self.next_release) {
            self.ready.push_back(result);
            self.next_release += 1;
        }
    }

    fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.next_release >= total)
    }

    fn is_exhausted(&self) -> bool {
        self.ready.is_empty()
            && (self.closed || self.total.is_some_and(|total| self.yielded >= total))
    }
}

/// Reorders batch results and hands them out in index order.
///
/// `window` bounds how far results may run ahead of what the consumer
/// has taken. A worker calls [`admit`](Self::admit) before processing
/// batch `i` and waits while `i >= yielded + window`. Every buffered
/// result then lies in `yielded..yielded + window`, so at most `window`
/// results are held, and a slow consumer pushes backpressure back to the
/// worker pool.
#[derive(Debug)]
pub struct CompletionTracker {
    state: Mutex<TrackerState>,
    changed: Condvar,
    window: u64,
}

impl CompletionTracker {
    pub fn new(window: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            changed: Condvar::new(),
            window: window.max(1) as u64,
        }
    }

    /// Lock tracker state with poison recovery
    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("thread panicked while holding completion state, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, TrackerState>) -> MutexGuard<'a, TrackerState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Note that a batch has been emitted and is on its way to a worker.
    pub fn register(&self, index: u64, seqs: Vec<u64>) {
        let mut state = self.lock_state();
        state.in_flight.insert(index, seqs);
        state.registered = state.registered.max(index + 1);
    }

    /// Wait until a result for `index` fits in the window ahead of the
    /// consumer.
    ///
    /// Returns `false` when `index` already has a result, for example
    /// one forced by a shutdown timeout; the batch should then be
    /// skipped. Cannot deadlock against a draining consumer: the lowest
    /// outstanding index is always inside the window once the released
    /// results have been taken.
    pub fn admit(&self, index: u64) -> bool {
        let mut state = self.lock_state();
        while !state.closed && index >= state.yielded + self.window {
            state = self.wait(state);
        }
        !(index < state.next_release || state.pending.contains_key(&index))
    }

    /// Record a finished batch.
    ///
    /// Returns `false` when the result was discarded because this index
    /// already has a result (for example one forced by a shutdown
    /// timeout). Never blocks beyond the state lock; callers bound the
    /// buffer by calling [`admit`](Self::admit) first.
    pub fn record(&self, result: BatchResult) -> bool {
        let index = result.index;
        let mut state = self.lock_state();

        let late = state.closed && state.total.is_some_and(|total| index >= total);
        if index < state.next_release || state.pending.contains_key(&index) || late {
            state.discarded += 1;
            debug!(batch = index, "discarding duplicate or late batch result");
            return false;
        }

        state.in_flight.remove(&index);
        state.pending.insert(index, result);
        state.release_ready();
        self.changed.notify_all();
        true
    }

    /// Declare how many batches will ever be recorded.
    pub fn set_total(&self, total: u64) {
        let mut state = self.lock_state();
        if state.closed {
            return;
        }
        state.total = Some(total);
        self.changed.notify_all();
    }

    /// Whether every batch up to the declared total has been released.
    pub fn is_complete(&self) -> bool {
        self.lock_state().is_complete()
    }

    /// Block until complete or until `deadline`; returns whether it completed.
    pub fn wait_complete(&self, deadline: Instant) -> bool {
        let mut state = self.lock_state();
        loop {
            if state.is_complete() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Force-complete every batch that has no result yet.
    ///
    /// Each missing index gets a `ShutdownTimeout` failure naming the
    /// records it carried; batches that already completed keep their
    /// real outcome. The tracker is closed afterwards and late results
    /// are discarded. Returns the forced indices in order.
    pub fn force_timeout(&self) -> Vec<u64> {
        let mut state = self.lock_state();
        let upper = state
            .total
            .unwrap_or(0)
            .max(state.registered)
            .max(state.next_release);

        let mut in_flight = std::mem::take(&mut state.in_flight);
        let mut forced = Vec::new();
        for index in state.next_release..upper {
            if state.pending.contains_key(&index) {
                continue;
            }
            let seqs = in_flight.remove(&index).unwrap_or_default();
            state.forced_records += seqs.len() as u64;
            let result = BatchResult::failure(
                index,
                seqs.len(),
                ErrorKind::ShutdownTimeout,
                seqs,
                "batch still in flight when the shutdown timeout elapsed",
            );
            state.pending.insert(index, result);
            forced.push(index);
        }

        state.total = Some(upper);
        state.release_ready();
        state.closed = true;
        self.changed.notify_all();

        if !forced.is_empty() {
            warn!(batches = ?forced, "force-reported in-flight batches after shutdown timeout");
        }
        forced
    }

    /// Mark the tracker closed; consumers end once buffered results are taken.
    pub fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        self.changed.notify_all();
    }

    /// Take the next released result, blocking until one is available.
    ///
    /// Returns `None` once the tracker is closed (or every declared batch
    /// has been yielded) and nothing remains buffered.
    pub(crate) fn next_ready(&self) -> Option<BatchResult> {
        let mut state = self.lock_state();
        loop {
            if let Some(result) = state.ready.pop_front() {
                state.yielded += 1;
                self.changed.notify_all();
                return Some(result);
            }
            if state.is_exhausted() {
                return None;
            }
            state = self.wait(state);
        }
    }

    /// Non-blocking variant of [`next_ready`](Self::next_ready)
    pub(crate) fn try_next_ready(&self) -> Option<BatchResult> {
        let mut state = self.lock_state();
        let result = state.ready.pop_front()?;
        state.yielded += 1;
        self.changed.notify_all();
        Some(result)
    }

    /// Ordered stream of results, starting at the next result not yet taken.
    ///
    /// Results are handed out once: a new `Drain` resumes where the last
    /// one stopped rather than replaying from index 0.
    pub fn drain(self: &Arc<Self>) -> Drain {
        Drain::new(Arc::clone(self))
    }

    /// Index of the next result a consumer will receive
    pub fn next_expected(&self) -> u64 {
        self.lock_state().yielded
    }

    /// Results recorded but not yet taken by a consumer
    pub fn buffered(&self) -> usize {
        let state = self.lock_state();
        state.pending.len() + state.ready.len()
    }

    pub fn discarded(&self) -> u64 {
        self.lock_state().discarded
    }

    /// Records carried by batches that `force_timeout` reported
    pub fn forced_records(&self) -> u64 {
        self.lock_state().forced_records
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }
}
