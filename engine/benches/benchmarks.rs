//! Performance benchmarks for possync-engine

use possync_engine::{
    Candidate, Candidates, DequeueRequest, ModelProfile, Mutation, Operation, PushResponse,
    RecordResult, ResolveHints, ResolveMode, Resolver, SyncQueue,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

fn filled_queue(records: i64) -> SyncQueue {
    let mut queue = SyncQueue::new(3);
    for i in 0..records {
        let mutation = Mutation::new(
            "pos.order",
            i,
            Operation::Create,
            json!({"name": format!("Order {}", i), "amount": i}),
            "WH1",
        )
        .with_priority((i % 3) as i32);
        queue.enqueue(mutation, 1_000 + i as u64);
    }
    queue
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    group.bench_function("enqueue_insert", |b| {
        let mut queue = SyncQueue::new(3);
        let mut id = 0i64;

        b.iter(|| {
            id += 1;
            let mutation = Mutation::new(
                "res.partner",
                id,
                Operation::Create,
                json!({"name": "Client"}),
                "WH1",
            );
            queue.enqueue(black_box(mutation), black_box(1_000))
        })
    });

    group.bench_function("enqueue_coalesce", |b| {
        let mut queue = filled_queue(1_000);
        let mut amount = 0i64;

        b.iter(|| {
            amount += 1;
            let mutation = Mutation::new(
                "pos.order",
                500,
                Operation::Write,
                json!({"amount": amount}),
                "WH1",
            );
            queue.enqueue(black_box(mutation), black_box(2_000))
        })
    });

    for size in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("dequeue_batch", size), &size, |b, &size| {
            b.iter_batched(
                || filled_queue(size),
                |mut queue| {
                    let batch = queue.dequeue_batch(
                        black_box(&DequeueRequest::new(100, "WH1")),
                        "cycle",
                        5_000,
                    );
                    for entry in &batch {
                        let _ = queue.mark_done(entry.id, 5_001);
                    }
                    batch.len()
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_resolver(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolver");

    let profile = ModelProfile::new("product.product")
        .natural_key(&["barcode"])
        .natural_key(&["default_code"])
        .discriminator("name");
    let record = json!({
        "id": 900,
        "id_database_old": 12,
        "barcode": "7501234",
        "default_code": "TEA-01",
        "name": "Green Tea",
    });

    group.bench_function("hints_from_record", |b| {
        b.iter(|| ResolveHints::from_record(black_box(&profile), black_box(&record)))
    });

    group.bench_function("resolve_ambiguous_legacy", |b| {
        let hints = ResolveHints::from_record(&profile, &record);
        let candidates = Candidates {
            by_legacy: (0..20)
                .map(|i| Candidate::new(i, None, json!({"name": format!("Product {}", i)})))
                .chain(std::iter::once(Candidate::new(
                    99,
                    None,
                    json!({"name": "Green Tea"}),
                )))
                .collect(),
            ..Candidates::default()
        };
        let resolver = Resolver::new(&profile, ResolveMode::Migration);

        b.iter(|| resolver.resolve(black_box(&hints), black_box(&candidates)))
    });

    group.finish();
}

fn bench_protocol(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol");

    let response = PushResponse {
        success: true,
        results: (0..100)
            .map(|i| {
                if i % 10 == 0 {
                    RecordResult::error(i, "invalid")
                } else {
                    RecordResult::ok(i).with_cloud_id(10_000 + i)
                }
            })
            .collect(),
        error: None,
    };
    let ids: Vec<i64> = (0..100).collect();

    group.bench_function("push_outcomes_100", |b| {
        b.iter(|| response.outcomes(black_box(&ids)))
    });

    group.bench_function("push_response_from_json", |b| {
        let json = serde_json::to_string(&response).unwrap_or_default();
        b.iter(|| serde_json::from_str::<PushResponse>(black_box(&json)))
    });

    group.finish();
}

criterion_group!(benches, bench_queue, bench_resolver, bench_protocol);
criterion_main!(benches);
