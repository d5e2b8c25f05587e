use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::parallel::BatcherConfig;

pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;
pub const DEFAULT_BATCH_MAX_WAIT: Duration = Duration::from_millis(200);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration for a [`Pipeline`](crate::Pipeline)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Emit a batch once it holds this many records
    pub batch_max_size: usize,
    /// Emit a partial batch once its first record has waited this long
    pub batch_max_wait: Duration,
    /// Number of worker threads
    pub concurrency: usize,
    /// Batches that may wait in the queue before the batcher blocks
    pub queue_capacity: usize,
    /// Upper bound on how long `stop` waits for in-flight batches
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let concurrency = num_cpus::get().max(1);
        Self {
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            batch_max_wait: DEFAULT_BATCH_MAX_WAIT,
            concurrency,
            queue_capacity: concurrency * 2,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_max_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if self.batch_max_wait.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "batch timeout must be greater than 0".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "queue capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            batch_size: self.batch_max_size,
            batch_timeout: self.batch_max_wait,
        }
    }

    /// Apply every value set in `settings` on top of this configuration
    pub fn with_settings(mut self, settings: &PipelineSettings) -> Self {
        if let Some(size) = settings.batch_max_size {
            self.batch_max_size = size;
        }
        if let Some(wait) = settings.batch_max_wait {
            self.batch_max_wait = wait;
        }
        if let Some(threads) = settings.concurrency {
            self.concurrency = threads;
            // Keep the queue proportional unless it was set explicitly
            if settings.queue_capacity.is_none() {
                self.queue_capacity = threads.max(1) * 2;
            }
        }
        if let Some(capacity) = settings.queue_capacity {
            self.queue_capacity = capacity;
        }
        if let Some(timeout) = settings.shutdown_timeout {
            self.shutdown_timeout = timeout;
        }
        self
    }
}

/// Partially specified pipeline configuration, as read from a config
/// file or the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSettings {
    pub batch_max_size: Option<usize>,
    pub batch_max_wait: Option<Duration>,
    pub concurrency: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub shutdown_timeout: Option<Duration>,
}

impl PipelineSettings {
    /// Combine two layers, with `overlay` taking precedence
    pub fn merge(base: Self, overlay: Self) -> Self {
        Self {
            batch_max_size: overlay.batch_max_size.or(base.batch_max_size),
            batch_max_wait: overlay.batch_max_wait.or(base.batch_max_wait),
            concurrency: overlay.concurrency.or(base.concurrency),
            queue_capacity: overlay.queue_capacity.or(base.queue_capacity),
            shutdown_timeout: overlay.shutdown_timeout.or(base.shutdown_timeout),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
