//! Retrieval benchmark: as-of lookups against an on-disk offline table.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use featurestream::events::EntityKey;
use featurestream::features::{AggregationFn, FeatureDefinition, FeatureRegistry, WindowAggregate, WindowSpec};
use featurestream::retrieval::PointInTimeJoin;
use featurestream::storage::OfflineTable;
use tempfile::tempdir;

fn bench_as_of(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let offline = Arc::new(OfflineTable::open(&dir.path().join("offline.db")).unwrap());
    let registry = FeatureRegistry::new(vec![FeatureDefinition {
        name: "clicks_1m".into(),
        entity_key_name: "user_id".into(),
        event_type: None,
        window: WindowSpec::Tumbling { length_ms: 60_000 },
        aggregation: AggregationFn::Count,
        ttl_ms: 600_000,
    }])
    .unwrap();

    let batch: Vec<WindowAggregate> = (0..100)
        .flat_map(|u| {
            (0..200).map(move |w| {
                WindowAggregate::new(
                    EntityKey::new("user_id", format!("u{u}")),
                    "clicks_1m".into(),
                    w * 60_000,
                    (w + 1) * 60_000,
                    w as f64,
                    0,
                )
            })
        })
        .collect();
    offline.append_batch(&batch).unwrap();

    let pit = PointInTimeJoin::new(Arc::clone(&offline), registry, Duration::from_millis(250));
    let key = EntityKey::new("user_id", "u42");
    let mut t = 0i64;

    c.bench_function("pit_as_of_20k_rows", |b| {
        b.iter(|| {
            t = (t + 37_000) % (200 * 60_000);
            black_box(pit.as_of(&key, t)).unwrap()
        })
    });
}

criterion_group!(benches, bench_as_of);
criterion_main!(benches);
