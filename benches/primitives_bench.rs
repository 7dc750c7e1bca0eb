//! Benchmarks for the scheduler's hot paths.
//!
//! Benchmarks cover:
//! - Breaker admission and outcome recording
//! - Token bucket acquisition
//! - ResourcePool acquire/release, uncontended and contended
//! - Error classification
//! - Trigger computation for each schedule type

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;

use session_scheduler::builders::ResourcePoolBuilder;
use session_scheduler::config::{ScheduleType, SchedulerConfig};
use session_scheduler::core::{classify, Breaker, BreakerConfig, RateLimiter};
use session_scheduler::scheduler::next_run_time;
use session_scheduler::session::reconcile_successes;

// ============================================================================
// Breaker and Rate Limiter
// ============================================================================

fn bench_breaker(c: &mut Criterion) {
    let breaker = Breaker::new("bench", BreakerConfig::default());

    c.bench_function("breaker_can_execute_closed", |b| {
        b.iter(|| black_box(breaker.can_execute()));
    });

    c.bench_function("breaker_record_success", |b| {
        b.iter(|| breaker.record_success());
    });

    c.bench_function("breaker_call_ok", |b| {
        b.iter(|| black_box(breaker.call(|| Ok::<_, std::io::Error>(1_u32))));
    });
}

fn bench_rate_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::new(1_000_000.0, 1_000);
    c.bench_function("rate_limiter_try_acquire", |b| {
        b.iter(|| black_box(limiter.try_acquire(1)));
    });
}

// ============================================================================
// Resource Pool
// ============================================================================

fn bench_pool_acquire_release(c: &mut Criterion) {
    let pool = ResourcePoolBuilder::new(|| Ok(String::from("handle")))
        .max_size(4)
        .build("bench")
        .expect("pool config is valid");

    c.bench_function("pool_acquire_release_uncontended", |b| {
        b.iter(|| {
            let lease = pool.acquire(Duration::from_secs(1)).expect("lease");
            pool.release(black_box(lease));
        });
    });
}

fn bench_pool_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_contended");

    for threads in [2_u64, 4, 8] {
        group.throughput(Throughput::Elements(threads * 100));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let pool = Arc::new(
                ResourcePoolBuilder::new(|| Ok(0_u64))
                    .max_size(2)
                    .build("contended")
                    .expect("pool config is valid"),
            );
            b.iter(|| {
                let workers: Vec<_> = (0..threads)
                    .map(|_| {
                        let pool = Arc::clone(&pool);
                        thread::spawn(move || {
                            for _ in 0..100 {
                                let conn = pool.connection().expect("lease");
                                black_box(&conn);
                            }
                        })
                    })
                    .collect();
                for worker in workers {
                    worker.join().expect("worker");
                }
            });
        });
    }

    group.finish();
}

// ============================================================================
// Classification, Reconciliation and Triggers
// ============================================================================

fn bench_classify(c: &mut Criterion) {
    let messages = [
        "connection reset by peer",
        "request timed out after 30s",
        "permission denied",
        "invalid value for field",
        "something unexpected",
    ];
    c.bench_function("classify_messages", |b| {
        b.iter(|| {
            for message in &messages {
                black_box(classify(black_box(*message)));
            }
        });
    });

    c.bench_function("reconcile_successes", |b| {
        b.iter(|| black_box(reconcile_successes(black_box(5), Some(10), Some(13))));
    });
}

fn bench_next_run_time(c: &mut Criterion) {
    let now = NaiveDate::from_ymd_opt(2026, 3, 4)
        .and_then(|d| d.and_hms_opt(10, 30, 0))
        .expect("valid timestamp");

    let mut group = c.benchmark_group("next_run_time");
    for schedule in [ScheduleType::Interval, ScheduleType::Daily, ScheduleType::Weekly] {
        let mut weekly = BTreeMap::new();
        weekly.insert("friday".to_string(), vec!["08:00".to_string(), "18:00".to_string()]);
        let cfg = SchedulerConfig {
            enabled: true,
            schedule_type: schedule,
            daily_times: vec!["09:00".into(), "13:00".into(), "21:00".into()],
            weekly,
            ..SchedulerConfig::default()
        };
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{schedule:?}")),
            &cfg,
            |b, cfg| {
                b.iter(|| black_box(next_run_time(cfg, black_box(now), None)));
            },
        );
    }
    group.finish();
}

criterion_group!(
    primitive_benches,
    bench_breaker,
    bench_rate_limiter,
    bench_classify,
    bench_next_run_time
);

criterion_group!(
    pool_benches,
    bench_pool_acquire_release,
    bench_pool_contended
);

criterion_main!(primitive_benches, pool_benches);
