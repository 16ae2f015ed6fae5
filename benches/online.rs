//! Online store benchmark: last-write-wins put and freshness-annotated get.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use featurestream::clock::ManualClock;
use featurestream::config::OnlineConfig;
use featurestream::events::EntityKey;
use featurestream::features::FeatureRegistry;
use featurestream::storage::OnlineStore;

fn store() -> OnlineStore {
    OnlineStore::new(
        OnlineConfig::default(),
        FeatureRegistry::new(Vec::new()).unwrap(),
        Arc::new(ManualClock::new(1_000_000)),
    )
}

fn bench_put(c: &mut Criterion) {
    let store = store();
    let keys: Vec<EntityKey> = (0..1_000).map(|i| EntityKey::new("user_id", format!("u{i}"))).collect();
    let mut t = 0i64;

    c.bench_function("online_put", |b| {
        b.iter(|| {
            t += 1;
            let key = &keys[(t as usize) % keys.len()];
            black_box(store.put(key, "clicks_1m", t as f64, t))
        })
    });
}

fn bench_get(c: &mut Criterion) {
    let store = store();
    let keys: Vec<EntityKey> = (0..10_000).map(|i| EntityKey::new("user_id", format!("u{i}"))).collect();
    for (i, key) in keys.iter().enumerate() {
        for feature in ["clicks_1m", "spend_5m", "pages_session"] {
            store.put(key, feature, i as f64, 900_000);
        }
    }
    let mut i = 0usize;

    c.bench_function("online_get", |b| {
        b.iter(|| {
            i = (i + 7) % keys.len();
            black_box(store.get(&keys[i]))
        })
    });
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);
