//! Performance benchmarks for the membership store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cohort::{
    ChangeRequest, Cohort, CohortConfig, DeliveryMode, ExpiryInstruction, Slug, Timestamp, UserId,
};
use std::time::Duration;
use tempfile::TempDir;

const HOUR: Duration = Duration::from_secs(3600);

fn create_cohort(dir: &TempDir, delivery: DeliveryMode, segments: usize) -> Cohort {
    let mut config = CohortConfig::at(dir.path().join("cohort"));
    config.publisher.delivery = delivery;
    let cohort = Cohort::open(config).unwrap();
    cohort.register_user(UserId(1), "bench").unwrap();
    for i in 0..segments {
        cohort.register_segment(&format!("SEG_{}", i)).unwrap();
    }
    cohort
}

fn slugs(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("SEG_{}", i)).collect()
}

/// Benchmark apply_change with varying batch sizes
fn bench_apply_change(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_change");

    for batch in [1, 10, 50] {
        for (name, delivery) in [
            ("immediate", DeliveryMode::Immediate),
            ("outbox", DeliveryMode::Outbox),
        ] {
            group.bench_with_input(BenchmarkId::new(name, batch), &batch, |b, &batch| {
                let dir = TempDir::new().unwrap();
                let cohort = create_cohort(&dir, delivery, batch);
                let ttl = Timestamp::now().plus(HOUR).to_rfc3339().unwrap();
                let request = ChangeRequest {
                    user_id: 1,
                    add_segments: slugs(batch),
                    ttl: Some(ttl),
                    ..Default::default()
                };

                b.iter(|| {
                    cohort.apply_change(black_box(&request)).unwrap();
                });
            });
        }
    }

    group.finish();
}

/// Benchmark reading current segments
fn bench_user_segments(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let cohort = create_cohort(&dir, DeliveryMode::Immediate, 100);
    cohort
        .apply_change(&ChangeRequest {
            user_id: 1,
            add_segments: slugs(100),
            ..Default::default()
        })
        .unwrap();

    c.bench_function("user_segments_100", |b| {
        b.iter(|| {
            black_box(cohort.user_segments(UserId(1)).unwrap());
        });
    });
}

/// Benchmark a due expiry instruction against a present membership
fn bench_expire(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let cohort = create_cohort(&dir, DeliveryMode::Immediate, 1);
    let consumer = cohort.expiry_consumer();
    let add = ChangeRequest {
        user_id: 1,
        add_segments: slugs(1),
        ..Default::default()
    };
    let instruction = ExpiryInstruction {
        user_id: UserId(1),
        segment: Slug::from("SEG_0"),
        ttl: Timestamp::now().minus(HOUR),
    };

    c.bench_function("expire_due", |b| {
        b.iter(|| {
            cohort.apply_change(&add).unwrap();
            black_box(consumer.expire(&instruction).unwrap());
        });
    });
}

/// Benchmark relaying pending outbox events
fn bench_outbox_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbox_dispatch");

    for pending in [10, 100] {
        group.bench_with_input(
            BenchmarkId::new("pending_changes", pending),
            &pending,
            |b, &pending| {
                let dir = TempDir::new().unwrap();
                let cohort = create_cohort(&dir, DeliveryMode::Outbox, 1);
                let request = ChangeRequest {
                    user_id: 1,
                    add_segments: slugs(1),
                    ..Default::default()
                };

                b.iter(|| {
                    for _ in 0..pending {
                        cohort.apply_change(&request).unwrap();
                    }
                    black_box(cohort.dispatch_outbox().unwrap());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_apply_change,
    bench_user_segments,
    bench_expire,
    bench_outbox_dispatch,
);

criterion_main!(benches);
