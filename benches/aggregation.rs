//! Aggregation benchmark: events → partition worker (ingest, watermark, window closure).

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use featurestream::config::FeatureStoreConfig;
use featurestream::events::Event;
use featurestream::features::{AggregationFn, FeatureDefinition, WindowSpec};
use featurestream::pipeline::PartitionWorker;

fn bench_config() -> FeatureStoreConfig {
    let mut config = FeatureStoreConfig::default();
    config.watermark.tolerance_ms = 10_000;
    config.features = vec![
        FeatureDefinition {
            name: "clicks_1m".into(),
            entity_key_name: "user_id".into(),
            event_type: None,
            window: WindowSpec::Tumbling { length_ms: 60_000 },
            aggregation: AggregationFn::Count,
            ttl_ms: 600_000,
        },
        FeatureDefinition {
            name: "spend_5m".into(),
            entity_key_name: "user_id".into(),
            event_type: None,
            window: WindowSpec::Sliding {
                length_ms: 300_000,
                hop_ms: 60_000,
            },
            aggregation: AggregationFn::Sum {
                field: "amount".into(),
            },
            ttl_ms: 600_000,
        },
    ];
    config
}

fn make_events(n: usize, users: usize) -> Vec<Event> {
    (0..n)
        .map(|i| {
            Event::new(i as i64 * 250, "click")
                .with_id(format!("ev-{i}"))
                .with_entity("user_id", format!("u{}", i % users))
                .with_field("amount", (i % 17) as f64)
        })
        .collect()
}

fn bench_ingest(c: &mut Criterion) {
    let config = bench_config();
    let registry = config.registry().unwrap();
    let events = make_events(10_000, 100);

    c.bench_function("worker_handle_10k_events", |b| {
        b.iter_batched(
            || PartitionWorker::new(0, registry.clone(), &config),
            |mut worker| {
                for e in &events {
                    let _ = black_box(worker.handle(e));
                }
                worker
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_ingest);
criterion_main!(benches);
