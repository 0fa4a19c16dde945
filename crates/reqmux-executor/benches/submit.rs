use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crossbeam_utils::sync::Parker;
use reqmux_core::RequestData;
use reqmux_executor::{Processor, ProcessorConfig, SubmissionQueue};
use reqmux_module::{LoopbackConfig, LoopbackMulti};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn loopback_processor() -> Processor {
    let config = LoopbackConfig::default().poll_interval(Duration::from_millis(5));
    Processor::start(ProcessorConfig::default(), move || LoopbackMulti::new(config)).unwrap()
}

fn bench_queue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("submission_queue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("push_try_pop", |b| {
        let parker = Parker::new();
        let q = SubmissionQueue::new(&parker);
        b.iter(|| {
            q.push(black_box(42u64)).unwrap();
            black_box(q.try_pop());
        });
    });
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let processor = loopback_processor();
    let mut group = c.benchmark_group("processor_round_trip");
    group.throughput(Throughput::Elements(1));

    group.bench_function("execute_blocking", |b| {
        b.iter(|| {
            let resp = processor
                .execute_blocking(RequestData::get("http://loop/bench"))
                .unwrap();
            black_box(resp.status);
        });
    });
    group.finish();
}

fn bench_concurrent_submitters(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_submit");

    for submitters in [1usize, 4, 8] {
        let per_thread = 100u64;
        group.throughput(Throughput::Elements(submitters as u64 * per_thread));
        group.bench_with_input(
            BenchmarkId::from_parameter(submitters),
            &submitters,
            |b, &n| {
                let processor = Arc::new(loopback_processor());
                b.iter(|| {
                    let handles: Vec<_> = (0..n)
                        .map(|_| {
                            let processor = Arc::clone(&processor);
                            thread::spawn(move || {
                                let futures: Vec<_> = (0..per_thread)
                                    .map(|_| processor.submit(RequestData::get("http://loop/c")).unwrap())
                                    .collect();
                                for fut in futures {
                                    black_box(fut.wait().unwrap());
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_queue_push_pop,
    bench_round_trip,
    bench_concurrent_submitters
);
criterion_main!(benches);
