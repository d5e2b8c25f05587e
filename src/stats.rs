use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

/// Statistics collected while a pipeline runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub records_submitted: u64,
    pub batches_emitted: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    /// Batches whose processing function returned an error or panicked
    pub worker_faults: u64,
    pub panics: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub forced_timeouts: u64,
    /// Results dropped because their batch already had one
    pub discarded_results: u64,
    pub processing_time: Duration,
}

impl PipelineStats {
    /// Add counters from `other` into `self`; `processing_time` is left alone.
    pub fn merge(&mut self, other: &PipelineStats) {
        self.records_submitted += other.records_submitted;
        self.batches_emitted += other.batches_emitted;
        self.batches_succeeded += other.batches_succeeded;
        self.batches_failed += other.batches_failed;
        self.worker_faults += other.worker_faults;
        self.panics += other.panics;
        self.records_processed += other.records_processed;
        self.records_failed += other.records_failed;
        self.forced_timeouts += other.forced_timeouts;
        self.discarded_results += other.discarded_results;
    }

    pub fn format_stats(&self) -> String {
        let mut output = format!(
            "Batches: {} emitted, {} ok, {} failed; Records: {} submitted, {} processed, {} failed",
            self.batches_emitted,
            self.batches_succeeded,
            self.batches_failed,
            self.records_submitted,
            self.records_processed,
            self.records_failed
        );

        if self.panics > 0 {
            output.push_str(&format!(", {} worker panics", self.panics));
        }
        if self.forced_timeouts > 0 {
            output.push_str(&format!(", {} timed out", self.forced_timeouts));
        }

        let processing_time_ms = self.processing_time.as_millis();
        output.push_str(&format!(" in {}ms", processing_time_ms));
        output
    }
}

/// Thread-safe collector that workers and the batcher merge into
#[derive(Debug, Clone)]
pub struct StatsCollector {
    stats: Arc<Mutex<PipelineStats>>,
    start_time: Instant,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(Mutex::new(PipelineStats::default())),
            start_time: Instant::now(),
        }
    }

    /// Lock stats with poison recovery
    fn lock_stats(&self) -> MutexGuard<'_, PipelineStats> {
        match self.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("thread panicked while holding pipeline stats, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn merge(&self, delta: &PipelineStats) {
        self.lock_stats().merge(delta);
    }

    pub fn add_batch_emitted(&self, records: usize) {
        let mut stats = self.lock_stats();
        stats.batches_emitted += 1;
        stats.records_submitted += records as u64;
    }

    pub fn add_forced_timeouts(&self, batches: usize, records: usize) {
        let mut stats = self.lock_stats();
        stats.forced_timeouts += batches as u64;
        stats.batches_failed += batches as u64;
        stats.records_failed += records as u64;
    }

    pub fn snapshot(&self) -> PipelineStats {
        let mut stats = self.lock_stats().clone();
        stats.processing_time = self.start_time.elapsed();
        stats
    }
}
