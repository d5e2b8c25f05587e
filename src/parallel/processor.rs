//! Pipeline controller
//!
//! Contains the [`Pipeline`] that wires the batcher, worker pool and
//! completion tracker together and owns the lifecycle state machine.

use crossbeam_channel::bounded;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::stats::{PipelineStats, StatsCollector};

use super::batching::Batcher;
use super::sink::Drain;
use super::tracker::CompletionTracker;
use super::types::{BatchResult, PipelineState, StopReport};
use super::worker::{BatchProcessor, WorkerPool};

#[derive(Debug)]
struct Lifecycle {
    state: PipelineState,
    report: Option<StopReport>,
}

/// Threads owned by a running pipeline
struct Runtime<T> {
    batcher: Arc<Batcher<T>>,
    pool: WorkerPool,
}

/// Batching pipeline with a bounded worker pool and ordered results.
///
/// Records go in through [`submit`](Self::submit) from any number of
/// threads; results come out of [`drain`](Self::drain) in batch index
/// order. A consumer must keep draining while records are submitted,
/// otherwise backpressure eventually blocks `submit`.
pub struct Pipeline<T> {
    config: PipelineConfig,
    processor: Arc<dyn BatchProcessor<T>>,
    lifecycle: Mutex<Lifecycle>,
    state_changed: Condvar,
    runtime: Mutex<Option<Runtime<T>>>,
    tracker: Arc<CompletionTracker>,
    stats: StatsCollector,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn new<P>(config: PipelineConfig, processor: P) -> Result<Self>
    where
        P: BatchProcessor<T> + 'static,
    {
        Self::with_processor(config, Arc::new(processor))
    }

    /// Build a pipeline around an already shared processor
    pub fn with_processor(
        config: PipelineConfig,
        processor: Arc<dyn BatchProcessor<T>>,
    ) -> Result<Self> {
        config.validate()?;
        let tracker = Arc::new(CompletionTracker::new(config.concurrency));

        Ok(Self {
            config,
            processor,
            lifecycle: Mutex::new(Lifecycle {
                state: PipelineState::Created,
                report: None,
            }),
            state_changed: Condvar::new(),
            runtime: Mutex::new(None),
            tracker,
            stats: StatsCollector::new(),
        })
    }

    /// Spawn the batcher and worker threads; `Created -> Running`.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.state != PipelineState::Created {
            return Err(PipelineError::AlreadyStarted(lifecycle.state));
        }

        let (batch_sender, batch_receiver) = bounded(self.config.queue_capacity);
        let batcher = Batcher::spawn(
            self.config.batcher_config(),
            batch_sender,
            Some(Arc::clone(&self.tracker)),
            self.stats.clone(),
        )?;

        let pool = match WorkerPool::start(
            self.config.concurrency,
            batch_receiver,
            Arc::clone(&self.tracker),
            Arc::clone(&self.processor),
            self.stats.clone(),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                batcher.close();
                return Err(e);
            }
        };

        *self.lock_runtime() = Some(Runtime {
            batcher: Arc::new(batcher),
            pool,
        });
        lifecycle.state = PipelineState::Running;
        self.state_changed.notify_all();

        info!(
            batch_max_size = self.config.batch_max_size,
            batch_max_wait_ms = self.config.batch_max_wait.as_millis() as u64,
            concurrency = self.config.concurrency,
            queue_capacity = self.config.queue_capacity,
            "pipeline started"
        );
        Ok(())
    }
}

impl<T> Pipeline<T> {
    /// Lock lifecycle with poison recovery
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("thread panicked while holding pipeline lifecycle, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Option<Runtime<T>>> {
        self.runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.lock_lifecycle().state
    }

    /// Counters collected so far
    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    /// Ordered result stream.
    ///
    /// Blocks while the next batch is outstanding and ends once the
    /// pipeline has stopped and every result has been taken. A second
    /// call resumes at the next result not yet taken.
    pub fn drain(&self) -> Drain {
        self.tracker.drain()
    }

    /// Hand one record to the pipeline.
    ///
    /// Blocks under backpressure. Fails with `NotRunning` outside the
    /// `Running` state, including when a concurrent `stop` seals the
    /// batcher while this call is waiting.
    pub fn submit(&self, payload: T) -> Result<()> {
        let batcher = self.running_batcher()?;
        batcher
            .submit(payload)
            .map_err(|_| PipelineError::NotRunning(self.state()))
    }

    /// Submit every record from `payloads`, returning how many were accepted.
    pub fn submit_all<I>(&self, payloads: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
    {
        let batcher = self.running_batcher()?;
        let mut accepted = 0;
        for payload in payloads {
            batcher
                .submit(payload)
                .map_err(|_| PipelineError::NotRunning(self.state()))?;
            accepted += 1;
        }
        Ok(accepted)
    }

    fn running_batcher(&self) -> Result<Arc<Batcher<T>>> {
        let lifecycle = self.lock_lifecycle();
        if lifecycle.state != PipelineState::Running {
            return Err(PipelineError::NotRunning(lifecycle.state));
        }
        self.lock_runtime()
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.batcher))
            .ok_or(PipelineError::NotRunning(lifecycle.state))
    }

    /// Stop accepting records, let in-flight batches finish and release
    /// every thread.
    ///
    /// Waits at most `shutdown_timeout` for outstanding batches. After
    /// that, submits still blocked are turned away, every accepted
    /// record without a result is reported in a `ShutdownTimeout`
    /// failure, and stalled workers are abandoned. Safe to call more than
    /// once or from several threads: every call returns the same report.
    pub fn stop(&self) -> Result<StopReport> {
        let mut lifecycle = self.lock_lifecycle();
        loop {
            match lifecycle.state {
                PipelineState::Created => {
                    self.tracker.set_total(0);
                    self.tracker.close();
                    let report = StopReport::default();
                    self.finish(&mut lifecycle, report.clone());
                    return Ok(report);
                }
                PipelineState::Running => {
                    lifecycle.state = PipelineState::Draining;
                    self.state_changed.notify_all();
                    break;
                }
                PipelineState::Draining => {
                    lifecycle = self
                        .state_changed
                        .wait(lifecycle)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                PipelineState::Stopped => {
                    return Ok(lifecycle.report.clone().unwrap_or_default());
                }
            }
        }
        drop(lifecycle);

        info!("pipeline draining");
        let runtime = self.lock_runtime().take();
        let report = match runtime {
            Some(runtime) => self.shut_down(runtime),
            None => StopReport::default(),
        };

        let mut lifecycle = self.lock_lifecycle();
        self.finish(&mut lifecycle, report.clone());
        Ok(report)
    }

    fn finish(&self, lifecycle: &mut Lifecycle, report: StopReport) {
        info!(
            batches = report.batches,
            forced = report.forced.len(),
            timed_out = report.timed_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "pipeline stopped"
        );
        lifecycle.state = PipelineState::Stopped;
        lifecycle.report = Some(report);
        self.state_changed.notify_all();
    }

    fn shut_down(&self, runtime: Runtime<T>) -> StopReport {
        let started = Instant::now();
        let deadline = started + self.config.shutdown_timeout;

        runtime.batcher.flush();
        if self.tracker.wait_complete(deadline) {
            let batches = runtime.batcher.close();
            runtime.pool.join();
            self.tracker.close();
            return StopReport {
                batches,
                forced: Vec::new(),
                timed_out: false,
                elapsed: started.elapsed(),
            };
        }

        // Release blocked submitters; everything they handed over is
        // registered so the timeout below can report it
        runtime.batcher.cancel();
        let batches = runtime.batcher.close();
        let forced = self.tracker.force_timeout();
        runtime.pool.cancel();
        self.stats
            .add_forced_timeouts(forced.len(), self.tracker.forced_records() as usize);
        warn!(
            timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
            batches = ?forced,
            "shutdown timeout elapsed with batches in flight"
        );

        // Stalled workers cannot be interrupted; their threads are detached
        if !runtime.pool.is_finished() {
            debug!(workers = runtime.pool.size(), "detaching worker threads");
        }
        drop(runtime);

        StopReport {
            batches,
            forced,
            timed_out: true,
            elapsed: started.elapsed(),
        }
    }
}

impl<T> Drop for Pipeline<T> {
    fn drop(&mut self) {
        if self.state() == PipelineState::Running {
            debug!("stopping pipeline on drop");
            let _ = self.stop();
        }
    }
}

/// Run `payloads` through a fresh pipeline and collect every result in order.
pub fn run<T, P, I>(config: PipelineConfig, processor: P, payloads: I) -> Result<Vec<BatchResult>>
where
    T: Send + 'static,
    P: BatchProcessor<T> + 'static,
    I: IntoIterator<Item = T>,
{
    let pipeline = Pipeline::new(config, processor)?;
    pipeline.start()?;
    let drain = pipeline.drain();

    thread::scope(|scope| {
        let collector = scope.spawn(move || drain.collect::<Vec<_>>());
        let submitted = pipeline.submit_all(payloads);
        let stopped = pipeline.stop();
        let results = collector
            .join()
            .unwrap_or_else(|payload| std::panic::resume_unwind(payload));

        submitted?;
        stopped?;
        Ok(results)
    })
}
