use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use logpipe::processors::{count_records, validate_json};
use logpipe::{run, PipelineConfig};

const RECORDS: usize = 20_000;

fn config(batch_max_size: usize, concurrency: usize) -> PipelineConfig {
    PipelineConfig {
        batch_max_size,
        batch_max_wait: Duration::from_millis(200),
        concurrency,
        queue_capacity: concurrency * 2,
        shutdown_timeout: Duration::from_secs(30),
    }
}

fn lines(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!(r#"{{"seq":{},"level":"info","msg":"request served"}}"#, i))
        .collect()
}

fn bench_count_by_batch_size(c: &mut Criterion) {
    let input = lines(RECORDS);
    let mut group = c.benchmark_group("count_by_batch_size");
    group.throughput(Throughput::Elements(RECORDS as u64));

    for batch_size in [10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter(|| {
                    let results = run(config(batch_size, 4), count_records, input.clone())
                        .expect("pipeline run");
                    black_box(results.len());
                });
            },
        );
    }
    group.finish();
}

fn bench_json_by_workers(c: &mut Criterion) {
    let input = lines(RECORDS);
    let mut group = c.benchmark_group("json_by_workers");
    group.throughput(Throughput::Elements(RECORDS as u64));

    for workers in [1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter(|| {
                let results = run(config(500, workers), validate_json, input.clone())
                    .expect("pipeline run");
                black_box(results.len());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_count_by_batch_size, bench_json_by_workers);
criterion_main!(benches);
