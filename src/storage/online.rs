//! Low-latency store of the latest feature values per entity, with TTL freshness and a
//! background eviction sweep.
//!
//! Each entity's record sits behind an `Arc` and is replaced wholesale on every write, so a
//! reader holding a clone always sees a complete record even if the entity is rewritten or
//! evicted underneath it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::OnlineConfig;
use crate::error::{FeatureStoreError, Result};
use crate::events::{EntityKey, TimestampMs};
use crate::features::FeatureRegistry;

#[derive(Debug, Clone, Copy, PartialEq)]
struct FeatureSlot {
    value: f64,
    effective_time: TimestampMs,
}

#[derive(Debug, Clone, Default)]
struct EntityRecord {
    features: HashMap<String, FeatureSlot>,
    generation: u64,
    /// Clock time of the last applied write.
    last_refreshed: TimestampMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    Applied,
    /// Stored value has a newer effective time; write ignored.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureValue {
    pub value: f64,
    pub effective_time: TimestampMs,
    /// `now - effective_time` at read time.
    pub freshness_ms: i64,
    pub ttl_ms: i64,
    pub stale: bool,
}

/// Snapshot of one entity's features as served online.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineFeatureVector {
    pub entity_key: EntityKey,
    pub features: BTreeMap<String, FeatureValue>,
    /// Newest effective time across features.
    pub effective_time: TimestampMs,
    pub read_at: TimestampMs,
    pub generation: u64,
}

impl OnlineFeatureVector {
    pub fn value(&self, feature: &str) -> Option<f64> {
        self.features.get(feature).map(|f| f.value)
    }

    pub fn any_stale(&self) -> bool {
        self.features.values().any(|f| f.stale)
    }

    /// Value only if present and within TTL.
    pub fn require_fresh(&self, feature: &str) -> Result<f64> {
        let f = self
            .features
            .get(feature)
            .ok_or_else(|| FeatureStoreError::FeatureMissing {
                entity: self.entity_key.to_string(),
                feature: feature.to_string(),
            })?;
        if f.stale {
            return Err(FeatureStoreError::StaleFeature {
                entity: self.entity_key.to_string(),
                feature: feature.to_string(),
                freshness_ms: f.freshness_ms,
            });
        }
        Ok(f.value)
    }
}

#[derive(Debug, Default)]
struct OnlineCounters {
    puts_applied: AtomicU64,
    puts_superseded: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_reads: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineStats {
    pub entities: u64,
    pub puts_applied: u64,
    pub puts_superseded: u64,
    pub hits: u64,
    pub misses: u64,
    pub stale_reads: u64,
    pub evicted: u64,
}

type Shard = RwLock<HashMap<EntityKey, Arc<EntityRecord>>>;

pub struct OnlineStore {
    shards: Vec<Shard>,
    registry: FeatureRegistry,
    config: OnlineConfig,
    clock: Arc<dyn Clock>,
    generation: AtomicU64,
    counters: OnlineCounters,
}

impl OnlineStore {
    pub fn new(config: OnlineConfig, registry: FeatureRegistry, clock: Arc<dyn Clock>) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            registry,
            config,
            clock,
            generation: AtomicU64::new(0),
            counters: OnlineCounters::default(),
        }
    }

    fn shard(&self, key: &EntityKey) -> &Shard {
        &self.shards[(key.stable_hash() % self.shards.len() as u64) as usize]
    }

    fn ttl_ms(&self, feature: &str) -> i64 {
        self.registry
            .ttl_ms(feature)
            .unwrap_or(self.config.default_ttl_ms)
    }

    /// Last-write-wins upsert keyed by `effective_time`: an older write than the stored one is
    /// a no-op. The entity record is swapped atomically.
    pub fn put(
        &self,
        entity_key: &EntityKey,
        feature_name: &str,
        value: f64,
        effective_time: TimestampMs,
    ) -> PutOutcome {
        let now = self.clock.now_ms();
        let mut shard = self.shard(entity_key).write();
        let current = shard.get(entity_key);
        if let Some(slot) = current.and_then(|r| r.features.get(feature_name)) {
            if effective_time < slot.effective_time {
                self.counters.puts_superseded.fetch_add(1, Ordering::Relaxed);
                return PutOutcome::Superseded;
            }
        }
        let mut record = current.map(|r| EntityRecord::clone(r)).unwrap_or_default();
        record.features.insert(
            feature_name.to_string(),
            FeatureSlot {
                value,
                effective_time,
            },
        );
        record.generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        record.last_refreshed = now;
        shard.insert(entity_key.clone(), Arc::new(record));
        self.counters.puts_applied.fetch_add(1, Ordering::Relaxed);
        PutOutcome::Applied
    }

    /// Latest features for `entity_key`, each annotated with freshness. Stale values are
    /// returned flagged, never hidden. `None` when the entity is unknown.
    pub fn get(&self, entity_key: &EntityKey) -> Option<OnlineFeatureVector> {
        let record = self.shard(entity_key).read().get(entity_key).cloned();
        let Some(record) = record else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.counters.hits.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now_ms();
        let mut effective_time = TimestampMs::MIN;
        let mut stale_any = false;
        let features = record
            .features
            .iter()
            .map(|(name, slot)| {
                let ttl_ms = self.ttl_ms(name);
                let freshness_ms = now.saturating_sub(slot.effective_time);
                let stale = freshness_ms > ttl_ms;
                stale_any |= stale;
                effective_time = effective_time.max(slot.effective_time);
                (
                    name.clone(),
                    FeatureValue {
                        value: slot.value,
                        effective_time: slot.effective_time,
                        freshness_ms,
                        ttl_ms,
                        stale,
                    },
                )
            })
            .collect();
        if stale_any {
            self.counters.stale_reads.fetch_add(1, Ordering::Relaxed);
        }
        Some(OnlineFeatureVector {
            entity_key: entity_key.clone(),
            features,
            effective_time,
            read_at: now,
            generation: record.generation,
        })
    }

    fn evictable(&self, record: &EntityRecord, now: TimestampMs) -> bool {
        let all_expired = record
            .features
            .iter()
            .all(|(name, slot)| now.saturating_sub(slot.effective_time) > self.ttl_ms(name));
        all_expired && now.saturating_sub(record.last_refreshed) > self.config.eviction_grace_ms
    }

    /// Remove entities whose every feature is past TTL and that have not been written within
    /// the grace window. A record rewritten between the scan and the removal is kept.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut evicted = 0;
        for shard in &self.shards {
            let candidates: Vec<(EntityKey, u64)> = shard
                .read()
                .iter()
                .filter(|(_, r)| self.evictable(r, now))
                .map(|(k, r)| (k.clone(), r.generation))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let mut guard = shard.write();
            for (key, generation) in candidates {
                if guard.get(&key).map(|r| r.generation) == Some(generation) {
                    guard.remove(&key);
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            self.counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "evicted expired entities");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .shards
            .iter()
            .flat_map(|s| s.read().keys().cloned().collect::<Vec<_>>())
            .collect();
        keys.sort();
        keys
    }

    /// Up to `n` distinct entity keys chosen uniformly.
    pub fn sample_keys<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<EntityKey> {
        let keys = self.keys();
        keys.choose_multiple(rng, n).cloned().collect()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn stats(&self) -> OnlineStats {
        let c = &self.counters;
        OnlineStats {
            entities: self.len() as u64,
            puts_applied: c.puts_applied.load(Ordering::Relaxed),
            puts_superseded: c.puts_superseded.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            stale_reads: c.stale_reads.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Run `evict_expired` every `every` until `shutdown` flips to true or its sender drops.
pub fn spawn_eviction_sweeper(
    store: Arc<OnlineStore>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.evict_expired();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("eviction sweeper stopped");
    })
}
