//! Compares the online serving value with the offline as-of value for the same entity and
//! instant; aggregates relative error over a sample into a pass/fail report.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ParityConfig;
use crate::error::{FeatureStoreError, Result};
use crate::events::{EntityKey, TimestampMs};
use crate::retrieval::{FeatureLookup, PointInTimeJoin};
use crate::storage::OnlineStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureParity {
    pub online_value: f64,
    pub offline_value: f64,
    pub relative_error: f64,
    /// Online value was past its TTL when read.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityParity {
    pub entity_key: EntityKey,
    pub reference_time: TimestampMs,
    pub features: BTreeMap<String, FeatureParity>,
    /// Found offline, absent online.
    pub missing_online: Vec<String>,
    /// Served online, no qualifying offline aggregate.
    pub missing_offline: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParityReport {
    /// RFC 3339 wall-clock time the run finished
    pub timestamp: String,
    pub reference_time: TimestampMs,
    pub entities_checked: usize,
    /// Mean relative error per feature
    pub per_feature: BTreeMap<String, f64>,
    /// Mean over every compared (entity, feature) pair
    pub overall_relative_error: f64,
    pub threshold: f64,
    pub passed: bool,
    pub missing_online: usize,
    pub missing_offline: usize,
}

impl ParityReport {
    pub fn ensure_passed(&self) -> Result<()> {
        if self.passed {
            Ok(())
        } else {
            Err(FeatureStoreError::ParityViolation {
                relative_error: self.overall_relative_error,
                threshold: self.threshold,
            })
        }
    }
}

pub fn relative_error(online: f64, offline: f64, epsilon: f64) -> f64 {
    (online - offline).abs() / offline.abs().max(epsilon)
}

pub struct ParityChecker {
    online: Arc<OnlineStore>,
    pit: PointInTimeJoin,
    config: ParityConfig,
    clock: Arc<dyn Clock>,
}

impl ParityChecker {
    pub fn new(
        online: Arc<OnlineStore>,
        pit: PointInTimeJoin,
        config: ParityConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            online,
            pit,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &ParityConfig {
        &self.config
    }

    /// Both paths for `entity_key` at the current clock time.
    pub fn check(&self, entity_key: &EntityKey) -> Result<EntityParity> {
        let reference_time = self.clock.now_ms();
        self.check_at(entity_key, reference_time)
    }

    /// Both paths with the offline side read as of `reference_time`. The online side is always
    /// the current serving value.
    pub fn check_at(
        &self,
        entity_key: &EntityKey,
        reference_time: TimestampMs,
    ) -> Result<EntityParity> {
        let online = self.online.get(entity_key);
        let offline = self.pit.as_of(entity_key, reference_time)?;

        let mut features = BTreeMap::new();
        let mut missing_online = Vec::new();
        let mut missing_offline = Vec::new();

        for (name, lookup) in &offline.features {
            let served = online.as_ref().and_then(|v| v.features.get(name));
            match (served, lookup) {
                (Some(on), FeatureLookup::Found { value, .. }) => {
                    features.insert(
                        name.clone(),
                        FeatureParity {
                            online_value: on.value,
                            offline_value: *value,
                            relative_error: relative_error(on.value, *value, self.config.epsilon),
                            stale: on.stale,
                        },
                    );
                }
                (None, FeatureLookup::Found { .. }) => missing_online.push(name.clone()),
                (Some(_), FeatureLookup::Missing) => missing_offline.push(name.clone()),
                (None, FeatureLookup::Missing) => {}
            }
        }

        Ok(EntityParity {
            entity_key: entity_key.clone(),
            reference_time,
            features,
            missing_online,
            missing_offline,
        })
    }

    /// One parity run over `sample`, all entities checked at the same reference time.
    pub fn run(&self, sample: &[EntityKey]) -> Result<ParityReport> {
        let reference_time = self.clock.now_ms();
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        let mut total = 0.0;
        let mut pairs = 0usize;
        let mut missing_online = 0;
        let mut missing_offline = 0;

        for key in sample {
            let entity = self.check_at(key, reference_time)?;
            for (name, fp) in &entity.features {
                let slot = sums.entry(name.clone()).or_insert((0.0, 0));
                slot.0 += fp.relative_error;
                slot.1 += 1;
                total += fp.relative_error;
                pairs += 1;
            }
            if !entity.missing_online.is_empty() || !entity.missing_offline.is_empty() {
                debug!(
                    entity = %key,
                    missing_online = ?entity.missing_online,
                    missing_offline = ?entity.missing_offline,
                    "parity gaps"
                );
            }
            missing_online += entity.missing_online.len();
            missing_offline += entity.missing_offline.len();
        }

        let per_feature = sums
            .into_iter()
            .map(|(name, (sum, n))| (name, sum / n as f64))
            .collect();
        let overall_relative_error = if pairs == 0 { 0.0 } else { total / pairs as f64 };
        let passed = overall_relative_error <= self.config.threshold;

        let report = ParityReport {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            reference_time,
            entities_checked: sample.len(),
            per_feature,
            overall_relative_error,
            threshold: self.config.threshold,
            passed,
            missing_online,
            missing_offline,
        };
        if passed {
            info!(
                entities = report.entities_checked,
                relative_error = report.overall_relative_error,
                "parity run passed"
            );
        } else {
            warn!(
                entities = report.entities_checked,
                relative_error = report.overall_relative_error,
                threshold = report.threshold,
                "parity violation"
            );
        }
        Ok(report)
    }

    /// Parity run over up to `n` entities sampled from the online store.
    pub fn run_sampled<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<ParityReport> {
        let sample = self.online.sample_keys(n, rng);
        self.run(&sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::OnlineConfig;
    use crate::features::{
        AggregationFn, FeatureDefinition, FeatureRegistry, WindowAggregate, WindowSpec,
    };
    use crate::storage::OfflineTable;
    use std::time::Duration;

    fn registry() -> FeatureRegistry {
        let def = |name: &str| FeatureDefinition {
            name: name.into(),
            entity_key_name: "user_id".into(),
            event_type: None,
            window: WindowSpec::Tumbling { length_ms: 60_000 },
            aggregation: AggregationFn::Count,
            ttl_ms: 600_000,
        };
        FeatureRegistry::new(vec![def("clicks"), def("views")]).unwrap()
    }

    fn checker() -> (ParityChecker, Arc<OfflineTable>, Arc<OnlineStore>) {
        let clock = Arc::new(ManualClock::new(200_000));
        let offline = Arc::new(OfflineTable::open_in_memory().unwrap());
        let online = Arc::new(OnlineStore::new(
            OnlineConfig::default(),
            registry(),
            clock.clone(),
        ));
        let pit = PointInTimeJoin::new(
            Arc::clone(&offline),
            registry(),
            Duration::from_millis(500),
        );
        let checker = ParityChecker::new(
            Arc::clone(&online),
            pit,
            ParityConfig::default(),
            clock,
        );
        (checker, offline, online)
    }

    fn u(id: &str) -> EntityKey {
        EntityKey::new("user_id", id)
    }

    #[test]
    fn relative_error_uses_epsilon_floor() {
        assert_eq!(relative_error(2.0, 2.0, 1e-9), 0.0);
        assert_eq!(relative_error(3.0, 2.0, 1e-9), 0.5);
        assert_eq!(relative_error(1.0, 0.0, 0.5), 2.0);
    }

    #[test]
    fn matching_paths_have_zero_error() {
        let (checker, offline, online) = checker();
        let agg = WindowAggregate::new(u("u1"), "clicks".into(), 60_000, 120_000, 4.0, 0);
        offline.append_batch(std::slice::from_ref(&agg)).unwrap();
        online.put(&agg.entity_key, "clicks", 4.0, agg.effective_time);

        let e = checker.check(&u("u1")).unwrap();
        assert_eq!(e.features["clicks"].relative_error, 0.0);
        assert!(e.missing_online.is_empty() && e.missing_offline.is_empty());

        let report = checker.run(&[u("u1")]).unwrap();
        assert!(report.passed);
        assert_eq!(report.overall_relative_error, 0.0);
        assert!(report.ensure_passed().is_ok());
    }

    #[test]
    fn divergence_over_threshold_fails_run() {
        let (checker, offline, online) = checker();
        offline
            .append_batch(&[WindowAggregate::new(u("u1"), "clicks".into(), 0, 60_000, 100.0, 0)])
            .unwrap();
        online.put(&u("u1"), "clicks", 101.0, 60_000);
        online.put(&u("u1"), "views", 1.0, 60_000);

        let report = checker.run(&[u("u1"), u("nobody")]).unwrap();
        assert!((report.per_feature["clicks"] - 0.01).abs() < 1e-12);
        assert!(!report.passed);
        assert_eq!(report.missing_offline, 1);
        assert_eq!(report.entities_checked, 2);
        assert!(matches!(
            report.ensure_passed(),
            Err(FeatureStoreError::ParityViolation { .. })
        ));
    }

    #[test]
    fn empty_sample_passes() {
        let (checker, _, _) = checker();
        let report = checker.run_sampled(10, &mut rand::thread_rng()).unwrap();
        assert!(report.passed);
        assert_eq!(report.entities_checked, 0);
        assert!(report.per_feature.is_empty());
    }
}
