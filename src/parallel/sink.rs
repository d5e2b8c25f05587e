//! Result sink for parallel processing
//!
//! [`Drain`] is the consumer side of the completion tracker: a blocking
//! iterator over batch results in index order. [`write_results`] drives
//! a drain into a writer for the command-line front end.

use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;

use super::tracker::CompletionTracker;
use super::types::{BatchResult, Outcome};

/// Ordered, blocking stream of batch results.
///
/// Ends once the pipeline has stopped and every result has been
/// released. Each result is handed out exactly once across all drains;
/// a new `Drain` does not replay from index 0. Dropping one part-way
/// loses nothing: the next call to `drain()` resumes at the first
/// result not yet taken.
#[derive(Debug)]
pub struct Drain {
    tracker: Arc<CompletionTracker>,
}

impl Drain {
    pub(crate) fn new(tracker: Arc<CompletionTracker>) -> Self {
        Self { tracker }
    }

    /// Take the next result if one is already released, without blocking.
    pub fn try_next(&mut self) -> Option<BatchResult> {
        self.tracker.try_next_ready()
    }
}

impl Iterator for Drain {
    type Item = BatchResult;

    fn next(&mut self) -> Option<BatchResult> {
        self.tracker.next_ready()
    }
}

/// How results are rendered by [`write_results`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultFormat {
    #[default]
    Text,
    Json,
}

/// Totals observed while writing results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub batches: u64,
    pub failed_batches: u64,
    pub records: usize,
}

/// Render one result as a single output line
pub fn format_result(result: &BatchResult, format: ResultFormat) -> Result<String> {
    match format {
        ResultFormat::Json => serde_json::to_string(result).context("serialising batch result"),
        ResultFormat::Text => Ok(match &result.outcome {
            Outcome::Success { processed } => format!(
                "batch {} processed: {} of {} records",
                result.index, processed, result.records
            ),
            Outcome::Failure {
                kind,
                failed,
                message,
            } => format!(
                "batch {} failed ({}): {} of {} records failed: {}",
                result.index,
                kind,
                failed.len(),
                result.records,
                message
            ),
        }),
    }
}

/// Write every result from `results` to `output`, one line each.
pub fn write_results<I, W>(results: I, output: &mut W, format: ResultFormat) -> Result<SinkSummary>
where
    I: IntoIterator<Item = BatchResult>,
    W: Write,
{
    let mut summary = SinkSummary::default();
    for result in results {
        writeln!(output, "{}", format_result(&result, format)?)
            .context("writing batch result")?;
        output.flush().context("flushing batch result")?;

        summary.batches += 1;
        summary.records += result.records;
        if !result.is_success() {
            summary.failed_batches += 1;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ErrorKind;

    #[test]
    fn test_format_text_lines() {
        let ok = BatchResult::success(0, 3, 3);
        assert_eq!(
            format_result(&ok, ResultFormat::Text).unwrap(),
            "batch 0 processed: 3 of 3 records"
        );

        let failed = BatchResult::failure(1, 2, ErrorKind::WorkerFault, vec![4], "bad json");
        assert_eq!(
            format_result(&failed, ResultFormat::Text).unwrap(),
            "batch 1 failed (worker fault): 1 of 2 records failed: bad json"
        );
    }

    #[test]
    fn test_write_results_counts_failures() {
        let results = vec![
            BatchResult::success(0, 2, 2),
            BatchResult::failure(1, 2, ErrorKind::ShutdownTimeout, vec![2, 3], "timeout"),
            BatchResult::success(2, 1, 1),
        ];
        let mut out = Vec::new();
        let summary = write_results(results, &mut out, ResultFormat::Json).unwrap();

        assert_eq!(
            summary,
            SinkSummary {
                batches: 3,
                failed_batches: 1,
                records: 5
            }
        );
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["kind"], "shutdown_timeout");
    }

    #[test]
    fn test_try_next_does_not_block() {
        let tracker = Arc::new(CompletionTracker::new(4));
        let mut drain = tracker.drain();
        assert!(drain.try_next().is_none());
        tracker.record(BatchResult::success(0, 1, 1));
        assert_eq!(drain.try_next().map(|r| r.index), Some(0));
    }
}
