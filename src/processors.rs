//! Built-in batch processors for line-oriented input

use clap::ValueEnum;
use std::sync::Arc;

use crate::parallel::{Batch, BatchProcessor, ProcessError};

/// Processor selected with `--processor`
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProcessorKind {
    /// Count records; never fails
    #[default]
    Count,
    /// Fail records that are not valid JSON
    Json,
    /// Fail blank records
    Nonempty,
}

impl ProcessorKind {
    pub fn build(self) -> Arc<dyn BatchProcessor<String>> {
        match self {
            ProcessorKind::Count => Arc::new(count_records),
            ProcessorKind::Json => Arc::new(validate_json),
            ProcessorKind::Nonempty => Arc::new(reject_blank),
        }
    }
}

pub fn count_records(batch: &Batch<String>) -> Result<usize, ProcessError> {
    Ok(batch.len())
}

pub fn validate_json(batch: &Batch<String>) -> Result<usize, ProcessError> {
    let mut first_error = None;
    let failed: Vec<u64> = batch
        .records
        .iter()
        .filter(|record| match serde_json::from_str::<serde_json::Value>(&record.payload) {
            Ok(_) => false,
            Err(e) => {
                first_error.get_or_insert_with(|| format!("record {}: {}", record.seq, e));
                true
            }
        })
        .map(|record| record.seq)
        .collect();

    reject(batch, failed, "not valid JSON", first_error)
}

pub fn reject_blank(batch: &Batch<String>) -> Result<usize, ProcessError> {
    let failed: Vec<u64> = batch
        .records
        .iter()
        .filter(|record| record.payload.trim().is_empty())
        .map(|record| record.seq)
        .collect();

    reject(batch, failed, "blank", None)
}

fn reject(
    batch: &Batch<String>,
    failed: Vec<u64>,
    reason: &str,
    detail: Option<String>,
) -> Result<usize, ProcessError> {
    if failed.is_empty() {
        return Ok(batch.len());
    }
    let mut message = format!("{} of {} records {}", failed.len(), batch.len(), reason);
    if let Some(detail) = detail {
        message.push_str(&format!(" (first: {})", detail));
    }
    Err(ProcessError::new(message).with_failed(failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::Record;
    use chrono::Utc;

    fn batch(lines: &[&str]) -> Batch<String> {
        let now = Utc::now();
        Batch {
            index: 0,
            records: lines
                .iter()
                .enumerate()
                .map(|(i, line)| Record {
                    seq: 10 + i as u64,
                    payload: line.to_string(),
                    ingested_at: now,
                })
                .collect(),
            created_at: now,
        }
    }

    #[test]
    fn test_count_always_succeeds() {
        assert_eq!(count_records(&batch(&["a", "", "{"])), Ok(3));
    }

    #[test]
    fn test_json_reports_bad_records() {
        let good = batch(&[r#"{"level":"info"}"#, "[1,2]", "42"]);
        assert_eq!(validate_json(&good), Ok(3));

        let mixed = batch(&[r#"{"ok":true}"#, "not json", r#"{"also":"fine"}"#, "{"]);
        let err = validate_json(&mixed).unwrap_err();
        assert_eq!(err.failed, vec![11, 13]);
        assert!(err.message.starts_with("2 of 4 records not valid JSON"));
        assert!(err.message.contains("record 11"));
    }

    #[test]
    fn test_nonempty_rejects_blank_lines() {
        let err = reject_blank(&batch(&["x", "   ", "y", ""])).unwrap_err();
        assert_eq!(err.failed, vec![11, 13]);
        assert_eq!(err.message, "2 of 4 records blank");
    }

    #[test]
    fn test_kind_builds_matching_processor() {
        let processor = ProcessorKind::Nonempty.build();
        assert!(processor.process(&batch(&["", "x"])).is_err());
        let processor = ProcessorKind::Count.build();
        assert_eq!(processor.process(&batch(&["", "x"])), Ok(2));
    }
}
