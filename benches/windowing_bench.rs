// Windowing Core Benchmarks

use criterion::{criterion_group, criterion_main, Criterion};
use rusty_stream::*;
use std::hint::black_box;
use std::time::Duration;

fn bench_window_assignment(c: &mut Criterion) {
    let fixed = WindowFn::Fixed { size: Duration::from_millis(10) };
    let sliding = WindowFn::Sliding {
        size: Duration::from_millis(60),
        period: Duration::from_millis(10),
    };

    c.bench_function("assign_fixed", |b| {
        b.iter(|| {
            for ts in 0..1_000i64 {
                black_box(fixed.assign(Timestamp::from_millis(ts)));
            }
        })
    });

    c.bench_function("assign_sliding_6x", |b| {
        b.iter(|| {
            for ts in 0..1_000i64 {
                black_box(sliding.assign(Timestamp::from_millis(ts)));
            }
        })
    });
}

fn bench_single_key_pipeline(c: &mut Criterion) {
    c.bench_function("pipeline_fixed_1k_elements", |b| {
        b.iter(|| {
            let strategy =
                WindowingStrategy::new(WindowFn::Fixed { size: Duration::from_millis(100) });
            let mut tester = TriggerTester::new(strategy).unwrap();
            for i in 0..1_000i64 {
                tester.process_element(i, i).unwrap();
            }
            tester.advance_input_watermark(100_000).unwrap();
            black_box(tester.extract_output())
        })
    });

    c.bench_function("pipeline_sessions_1k_elements", |b| {
        b.iter(|| {
            let strategy =
                WindowingStrategy::new(WindowFn::Sessions { gap: Duration::from_millis(5) });
            let mut tester = TriggerTester::new(strategy).unwrap();
            for i in 0..1_000i64 {
                tester.process_element(i, i * 3).unwrap();
            }
            tester.advance_input_watermark(1_000_000).unwrap();
            black_box(tester.extract_output())
        })
    });
}

criterion_group!(benches, bench_window_assignment, bench_single_key_pipeline);
criterion_main!(benches);
