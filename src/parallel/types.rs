//! Type definitions for parallel processing
//!
//! Contains data structures for records, batches, results, and the
//! pipeline lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A single ingested log record
#[derive(Debug, Clone)]
pub struct Record<T> {
    /// Monotonic sequence number assigned by the batcher on receipt
    pub seq: u64,
    pub payload: T,
    pub ingested_at: DateTime<Utc>,
}

/// A batch of records to be processed together
#[derive(Debug, Clone)]
pub struct Batch<T> {
    /// Zero-based, contiguous batch index
    pub index: u64,
    pub records: Vec<Record<T>>,
    pub created_at: DateTime<Utc>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sequence numbers of every record in the batch, in submission order
    pub fn seqs(&self) -> Vec<u64> {
        self.records.iter().map(|r| r.seq).collect()
    }

    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.records.iter().map(|r| &r.payload)
    }
}

/// Why a batch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The processing function returned an error or panicked
    WorkerFault,
    /// The batch was still in flight when the shutdown timeout fired
    ShutdownTimeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::WorkerFault => write!(f, "worker fault"),
            ErrorKind::ShutdownTimeout => write!(f, "shutdown timeout"),
        }
    }
}

/// Outcome of processing one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        processed: usize,
    },
    Failure {
        kind: ErrorKind,
        /// Sequence numbers of the records that failed
        failed: Vec<u64>,
        message: String,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// Result of processing a batch; produced exactly once per batch index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub index: u64,
    /// Number of records that were in the batch
    pub records: usize,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub completed_at: DateTime<Utc>,
}

impl BatchResult {
    pub fn success(index: u64, records: usize, processed: usize) -> Self {
        Self {
            index,
            records,
            outcome: Outcome::Success { processed },
            completed_at: Utc::now(),
        }
    }

    pub fn failure(
        index: u64,
        records: usize,
        kind: ErrorKind,
        failed: Vec<u64>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            index,
            records,
            outcome: Outcome::Failure {
                kind,
                failed,
                message: message.into(),
            },
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Lifecycle of a pipeline instance. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Created, Running) | (Created, Stopped) | (Running, Draining) | (Draining, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == PipelineState::Stopped
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Created => "created",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Summary returned by `Pipeline::stop`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Number of batches the pipeline emitted over its lifetime
    pub batches: u64,
    /// Batch indices force-reported as `ShutdownTimeout`
    pub forced: Vec<u64>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Configuration for the batcher thread
#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    /// Emit once the open batch holds this many records
    pub batch_size: usize,
    /// Emit once the first record of the open batch has waited this long
    pub batch_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_only_move_forward() {
        use PipelineState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));
        assert!(Created.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(Created));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Draining.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn test_batch_result_json_shape() {
        let result = BatchResult::failure(4, 2, ErrorKind::WorkerFault, vec![8, 9], "boom");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["index"], 4);
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "worker_fault");
        assert_eq!(json["failed"], serde_json::json!([8, 9]));

        let ok = serde_json::to_value(BatchResult::success(0, 3, 3)).unwrap();
        assert_eq!(ok["status"], "success");
        assert_eq!(ok["processed"], 3);
    }

    #[test]
    fn test_batch_seqs_preserve_order() {
        let now = Utc::now();
        let batch = Batch {
            index: 0,
            records: (5..8)
                .map(|seq| Record {
                    seq,
                    payload: format!("line {}", seq),
                    ingested_at: now,
                })
                .collect(),
            created_at: now,
        };
        assert_eq!(batch.seqs(), vec![5, 6, 7]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.payloads().next().map(String::as_str), Some("line 5"));
    }
}
