use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use logpipe::{
    run, Batch, BatchResult, ErrorKind, Outcome, Pipeline, PipelineConfig, PipelineError,
    PipelineState, ProcessError,
};

fn config(batch_max_size: usize, concurrency: usize) -> PipelineConfig {
    PipelineConfig {
        batch_max_size,
        batch_max_wait: Duration::from_secs(10),
        concurrency,
        queue_capacity: concurrency * 2,
        shutdown_timeout: Duration::from_secs(10),
    }
}

fn count<T>(batch: &Batch<T>) -> Result<usize, ProcessError> {
    Ok(batch.len())
}

fn indices(results: &[BatchResult]) -> Vec<u64> {
    results.iter().map(|r| r.index).collect()
}

#[test]
fn test_batches_follow_submission_order() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let processor = move |batch: &Batch<&'static str>| -> Result<usize, ProcessError> {
        if batch.index == 0 {
            // Let batch 1 finish first
            thread::sleep(Duration::from_millis(50));
        }
        let payloads: Vec<&str> = batch.payloads().copied().collect();
        recorder.lock().unwrap().push((batch.index, batch.seqs(), payloads));
        Ok(batch.len())
    };

    let results = run(config(2, 2), processor, ["r0", "r1", "r2", "r3", "r4"]).unwrap();
    assert_eq!(indices(&results), vec![0, 1, 2]);

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            (0, vec![0, 1], vec!["r0", "r1"]),
            (1, vec![2, 3], vec!["r2", "r3"]),
            (2, vec![4], vec!["r4"]),
        ]
    );
}

#[test]
fn test_empty_stream_drains_nothing() {
    let results = run(config(4, 2), count::<u8>, Vec::new()).unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_panicking_batch_does_not_stop_pipeline() {
    let processor = |batch: &Batch<u32>| -> Result<usize, ProcessError> {
        if batch.records.iter().any(|r| r.payload == 13) {
            panic!("unlucky record");
        }
        Ok(batch.len())
    };
    let results = run(config(5, 3), processor, 0..40u32).unwrap();

    assert_eq!(indices(&results), (0..8).collect::<Vec<_>>());
    let faults: Vec<u64> = results
        .iter()
        .filter(|r| r.outcome.error_kind() == Some(ErrorKind::WorkerFault))
        .map(|r| r.index)
        .collect();
    assert_eq!(faults, vec![2]);
    match &results[2].outcome {
        Outcome::Failure { failed, message, .. } => {
            assert_eq!(failed, &vec![10, 11, 12, 13, 14]);
            assert!(message.contains("unlucky record"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[test]
fn test_submit_outside_running_is_rejected() {
    let pipeline = Pipeline::new(config(2, 1), count::<u8>).unwrap();
    assert!(matches!(
        pipeline.submit(1),
        Err(PipelineError::NotRunning(PipelineState::Created))
    ));

    pipeline.start().unwrap();
    pipeline.stop().unwrap();
    assert!(matches!(
        pipeline.submit(1),
        Err(PipelineError::NotRunning(PipelineState::Stopped))
    ));
    assert!(matches!(
        pipeline.submit_all(vec![1, 2]),
        Err(PipelineError::NotRunning(PipelineState::Stopped))
    ));
}

#[test]
fn test_concurrent_submitters_get_every_record_once() {
    let pipeline = Arc::new(Pipeline::new(config(7, 4), count::<u64>).unwrap());
    pipeline.start().unwrap();
    let drain = pipeline.drain();
    let consumer = thread::spawn(move || drain.collect::<Vec<_>>());

    let submitters: Vec<_> = (0..4u64)
        .map(|t| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || pipeline.submit_all((0..250).map(|i| t * 1000 + i)).unwrap())
        })
        .collect();
    let accepted: usize = submitters.into_iter().map(|h| h.join().unwrap()).sum();
    let report = pipeline.stop().unwrap();
    let results = consumer.join().unwrap();

    assert_eq!(accepted, 1000);
    assert_eq!(report.batches, 143);
    assert_eq!(indices(&results), (0..143).collect::<Vec<_>>());
    let records: usize = results.iter().map(|r| r.records).sum();
    assert_eq!(records, 1000);

    let stats = pipeline.stats();
    assert_eq!(stats.records_submitted, 1000);
    assert_eq!(stats.records_processed, 1000);
    assert_eq!(stats.batches_emitted, 143);
}

#[test]
fn test_concurrent_stop_callers_share_one_report() {
    let pipeline = Arc::new(
        Pipeline::new(config(2, 2), |b: &Batch<u32>| -> Result<usize, ProcessError> {
            thread::sleep(Duration::from_millis(20));
            Ok(b.len())
        })
        .unwrap(),
    );
    pipeline.start().unwrap();
    let drain = pipeline.drain();
    let consumer = thread::spawn(move || drain.collect::<Vec<_>>());
    pipeline.submit_all(0..9).unwrap();

    let barrier = Arc::new(Barrier::new(3));
    let stoppers: Vec<_> = (0..3)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                pipeline.stop().unwrap()
            })
        })
        .collect();
    let reports: Vec<_> = stoppers.into_iter().map(|h| h.join().unwrap()).collect();
    let results = consumer.join().unwrap();

    assert!(reports.iter().all(|r| r == &reports[0]));
    assert_eq!(reports[0].batches, 5);
    assert!(!reports[0].timed_out);
    assert_eq!(indices(&results), vec![0, 1, 2, 3, 4]);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn test_shutdown_timeout_reports_only_stalled_batches() {
    let release = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&release);
    let processor = move |batch: &Batch<u32>| -> Result<usize, ProcessError> {
        if batch.index == 0 {
            while !gate.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(batch.len())
    };

    let mut cfg = config(2, 2);
    cfg.shutdown_timeout = Duration::from_millis(100);
    let pipeline = Pipeline::new(cfg, processor).unwrap();
    pipeline.start().unwrap();
    let drain = pipeline.drain();
    let consumer = thread::spawn(move || drain.collect::<Vec<_>>());

    pipeline.submit_all(0..4).unwrap();
    let started = Instant::now();
    let report = pipeline.stop().unwrap();
    let stop_took = started.elapsed();
    let results = consumer.join().unwrap();

    // The stalled worker finishing later must not add a second result
    release.store(true, Ordering::Release);
    thread::sleep(Duration::from_millis(50));

    assert!(report.timed_out);
    assert_eq!(report.forced, vec![0]);
    assert!(stop_took >= Duration::from_millis(100));
    assert!(stop_took < Duration::from_secs(2), "stop took {:?}", stop_took);

    assert_eq!(indices(&results), vec![0, 1]);
    match &results[0].outcome {
        Outcome::Failure { kind, failed, .. } => {
            assert_eq!(*kind, ErrorKind::ShutdownTimeout);
            assert_eq!(failed, &vec![0, 1]);
        }
        other => panic!("expected shutdown timeout, got {:?}", other),
    }
    assert!(results[1].is_success());
    assert_eq!(pipeline.drain().count(), 0);
    assert_eq!(pipeline.stop().unwrap(), report);
}

#[test]
fn test_timed_out_stop_turns_away_blocked_submitter_and_reports_every_record() {
    let release = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&release);
    let processor = move |batch: &Batch<u32>| -> Result<usize, ProcessError> {
        if batch.index == 0 {
            while !gate.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(batch.len())
    };

    let cfg = PipelineConfig {
        batch_max_size: 1,
        batch_max_wait: Duration::from_secs(10),
        concurrency: 1,
        queue_capacity: 1,
        shutdown_timeout: Duration::from_millis(100),
    };
    let pipeline = Arc::new(Pipeline::new(cfg, processor).unwrap());
    pipeline.start().unwrap();
    let drain = pipeline.drain();
    let consumer = thread::spawn(move || drain.collect::<Vec<_>>());

    let accepted = Arc::new(AtomicUsize::new(0));
    let producer = {
        let pipeline = Arc::clone(&pipeline);
        let accepted = Arc::clone(&accepted);
        thread::spawn(move || {
            for i in 0..10u32 {
                if let Err(e) = pipeline.submit(i) {
                    return Some(e);
                }
                accepted.fetch_add(1, Ordering::SeqCst);
            }
            None
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!producer.is_finished(), "the stalled batch should hold the producer back");

    let report = pipeline.stop().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    let waited = Instant::now();
    while !producer.is_finished() && waited.elapsed() < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(producer.is_finished(), "submit still blocked after stop returned");
    let rejection = producer.join().unwrap();
    assert!(matches!(rejection, Some(PipelineError::NotRunning(_))));
    let results = consumer.join().unwrap();
    release.store(true, Ordering::Release);

    let accepted = accepted.load(Ordering::SeqCst);
    assert!(report.timed_out);
    assert_eq!(report.batches as usize, accepted);
    assert_eq!(report.forced, (0..accepted as u64).collect::<Vec<_>>());
    assert_eq!(indices(&results), (0..accepted as u64).collect::<Vec<_>>());
    assert_eq!(results.iter().map(|r| r.records).sum::<usize>(), accepted);
    assert!(results
        .iter()
        .all(|r| r.outcome.error_kind() == Some(ErrorKind::ShutdownTimeout)));
    assert_eq!(pipeline.stats().records_submitted as usize, accepted);
}

#[test]
fn test_slow_consumer_applies_backpressure() {
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);
    let pipeline = Arc::new(
        Pipeline::new(config(1, 1), move |b: &Batch<u32>| -> Result<usize, ProcessError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(b.len())
        })
        .unwrap(),
    );
    pipeline.start().unwrap();

    let producer = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || pipeline.submit_all(0..50).unwrap())
    };

    // Nobody drains yet: processing stalls well short of the input
    thread::sleep(Duration::from_millis(200));
    let stalled_at = processed.load(Ordering::SeqCst);
    assert!(stalled_at < 50, "processed {} without a consumer", stalled_at);
    assert_eq!(pipeline.stats().batches_succeeded as usize, stalled_at);
    assert!(!producer.is_finished());

    let mut drain = pipeline.drain();
    let mut seen = HashSet::new();
    while seen.len() < 50 {
        let result = drain.next().expect("results until every batch is seen");
        assert!(seen.insert(result.index));
    }
    assert_eq!(producer.join().unwrap(), 50);
    pipeline.stop().unwrap();
    assert!(drain.next().is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_results_contiguous_for_any_completion_order(
        delays in prop::collection::vec(0u64..4, 1..40),
        batch_size in 1usize..5,
        workers in 1usize..5,
    ) {
        let delays = Arc::new(delays);
        let count = delays.len();
        let table = Arc::clone(&delays);
        let processor = move |batch: &Batch<usize>| -> Result<usize, ProcessError> {
            let delay = table[batch.records[0].payload];
            thread::sleep(Duration::from_millis(delay));
            Ok(batch.len())
        };

        let results = run(config(batch_size, workers), processor, 0..count).unwrap();
        let expected = count.div_ceil(batch_size) as u64;
        prop_assert_eq!(indices(&results), (0..expected).collect::<Vec<_>>());
        prop_assert_eq!(results.iter().map(|r| r.records).sum::<usize>(), count);
    }
}
