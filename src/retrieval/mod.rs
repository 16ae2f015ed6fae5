//! Point-in-time (as-of) retrieval over the offline table.
//!
//! The one rule this module exists to keep: a value with `effective_time > reference_time` is
//! never returned. Features with no qualifying aggregate come back as `Missing`, not zero.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FeatureStoreError, Result};
use crate::events::{EntityKey, TimestampMs};
use crate::features::{FeatureRegistry, WindowAggregate};
use crate::storage::{OfflineTable, TimeRange};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeatureLookup {
    Found {
        value: f64,
        effective_time: TimestampMs,
        window_start: TimestampMs,
        window_end: TimestampMs,
    },
    Missing,
}

impl FeatureLookup {
    pub fn value(&self) -> Option<f64> {
        match self {
            FeatureLookup::Found { value, .. } => Some(*value),
            FeatureLookup::Missing => None,
        }
    }
}

impl From<Option<WindowAggregate>> for FeatureLookup {
    fn from(agg: Option<WindowAggregate>) -> Self {
        match agg {
            Some(a) => FeatureLookup::Found {
                value: a.value,
                effective_time: a.effective_time,
                window_start: a.window_start,
                window_end: a.window_end,
            },
            None => FeatureLookup::Missing,
        }
    }
}

/// Feature vector synthesized from the offline table as of `reference_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointInTimeVector {
    pub entity_key: EntityKey,
    pub reference_time: TimestampMs,
    pub features: BTreeMap<String, FeatureLookup>,
}

impl PointInTimeVector {
    /// Newest effective time among found features; `None` if all are missing.
    pub fn effective_time(&self) -> Option<TimestampMs> {
        self.features
            .values()
            .filter_map(|f| match f {
                FeatureLookup::Found { effective_time, .. } => Some(*effective_time),
                FeatureLookup::Missing => None,
            })
            .max()
    }

    pub fn value(&self, feature: &str) -> Option<f64> {
        self.features.get(feature).and_then(FeatureLookup::value)
    }

    pub fn require(&self, feature: &str) -> Result<f64> {
        self.value(feature)
            .ok_or_else(|| FeatureStoreError::FeatureMissing {
                entity: self.entity_key.to_string(),
                feature: feature.to_string(),
            })
    }

    /// Explicit caller-chosen default for a missing feature.
    pub fn value_or(&self, feature: &str, default: f64) -> f64 {
        self.value(feature).unwrap_or(default)
    }

    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.features
            .iter()
            .filter(|(_, f)| matches!(f, FeatureLookup::Missing))
            .map(|(name, _)| name.as_str())
    }
}

pub struct PointInTimeJoin {
    offline: Arc<OfflineTable>,
    registry: FeatureRegistry,
    deadline: Duration,
}

impl PointInTimeJoin {
    pub fn new(offline: Arc<OfflineTable>, registry: FeatureRegistry, deadline: Duration) -> Self {
        Self {
            offline,
            registry,
            deadline,
        }
    }

    pub fn as_of(
        &self,
        entity_key: &EntityKey,
        reference_time: TimestampMs,
    ) -> Result<PointInTimeVector> {
        self.as_of_with_deadline(entity_key, reference_time, self.deadline)
    }

    /// Every feature defined for `entity_key.name`, as of `reference_time`. Fails with
    /// `RetrievalTimeout` rather than returning a partial vector once `deadline` is spent.
    pub fn as_of_with_deadline(
        &self,
        entity_key: &EntityKey,
        reference_time: TimestampMs,
        deadline: Duration,
    ) -> Result<PointInTimeVector> {
        let started = Instant::now();
        let timeout = || FeatureStoreError::RetrievalTimeout {
            operation: "as_of",
            deadline_ms: deadline.as_millis() as u64,
        };

        let mut features = BTreeMap::new();
        for def in self.registry.for_entity(&entity_key.name) {
            let remaining = deadline.checked_sub(started.elapsed()).ok_or_else(timeout)?;
            let found = self
                .offline
                .latest_as_of(entity_key, &def.name, reference_time, remaining)?;
            debug_assert!(found
                .as_ref()
                .map_or(true, |a| a.effective_time <= reference_time));
            features.insert(def.name.clone(), FeatureLookup::from(found));
        }
        if features.is_empty() {
            return Err(FeatureStoreError::Config(format!(
                "no features defined for entity key {}",
                entity_key.name
            )));
        }
        if started.elapsed() > deadline {
            return Err(timeout());
        }

        let vector = PointInTimeVector {
            entity_key: entity_key.clone(),
            reference_time,
            features,
        };
        debug!(
            entity = %entity_key,
            reference_time,
            missing = vector.missing().count(),
            "as_of"
        );
        Ok(vector)
    }

    /// Point-in-time join over a spine of `(entity, reference_time)` training examples.
    pub fn as_of_batch(
        &self,
        spine: &[(EntityKey, TimestampMs)],
    ) -> Result<Vec<PointInTimeVector>> {
        spine
            .iter()
            .map(|(key, t)| self.as_of(key, *t))
            .collect()
    }

    /// Read-only range export for the training collaborator.
    pub fn scan(&self, entity_key: &EntityKey, range: TimeRange) -> Result<Vec<WindowAggregate>> {
        self.offline.scan(entity_key, range, self.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{AggregationFn, FeatureDefinition, WindowSpec};

    fn def(name: &str, key: &str) -> FeatureDefinition {
        FeatureDefinition {
            name: name.into(),
            entity_key_name: key.into(),
            event_type: None,
            window: WindowSpec::Tumbling { length_ms: 60_000 },
            aggregation: AggregationFn::Count,
            ttl_ms: 600_000,
        }
    }

    fn engine() -> (PointInTimeJoin, Arc<OfflineTable>) {
        let offline = Arc::new(OfflineTable::open_in_memory().unwrap());
        let registry = FeatureRegistry::new(vec![
            def("clicks", "user_id"),
            def("views", "user_id"),
            def("buys", "product_id"),
        ])
        .unwrap();
        (
            PointInTimeJoin::new(Arc::clone(&offline), registry, Duration::from_millis(500)),
            offline,
        )
    }

    #[test]
    fn missing_is_not_zero() {
        let (pit, offline) = engine();
        let key = EntityKey::new("user_id", "u1");
        offline
            .append_batch(&[WindowAggregate::new(
                key.clone(),
                "clicks".into(),
                0,
                60_000,
                2.0,
                0,
            )])
            .unwrap();
        let v = pit.as_of(&key, 65_000).unwrap();
        assert_eq!(v.value("clicks"), Some(2.0));
        assert_eq!(v.features["views"], FeatureLookup::Missing);
        assert!(matches!(
            v.require("views"),
            Err(FeatureStoreError::FeatureMissing { .. })
        ));
        assert_eq!(v.value_or("views", -1.0), -1.0);
        assert_eq!(v.effective_time(), Some(60_000));
        assert!(!v.features.contains_key("buys"));
    }

    #[test]
    fn before_first_close_everything_is_missing() {
        let (pit, _) = engine();
        let v = pit.as_of(&EntityKey::new("user_id", "new"), 1_000).unwrap();
        assert_eq!(v.missing().count(), 2);
        assert_eq!(v.effective_time(), None);
    }

    #[test]
    fn unknown_entity_kind_is_a_config_error() {
        let (pit, _) = engine();
        assert!(matches!(
            pit.as_of(&EntityKey::new("store_id", "s1"), 0),
            Err(FeatureStoreError::Config(_))
        ));
    }

    #[test]
    fn batch_join_respects_each_reference_time() {
        let (pit, offline) = engine();
        let key = EntityKey::new("user_id", "u1");
        offline
            .append_batch(&[
                WindowAggregate::new(key.clone(), "clicks".into(), 0, 60_000, 2.0, 0),
                WindowAggregate::new(key.clone(), "clicks".into(), 60_000, 120_000, 5.0, 0),
            ])
            .unwrap();
        let rows = pit
            .as_of_batch(&[(key.clone(), 30_000), (key.clone(), 90_000), (key, 120_000)])
            .unwrap();
        let values: Vec<_> = rows.iter().map(|r| r.value("clicks")).collect();
        assert_eq!(values, vec![None, Some(2.0), Some(5.0)]);
    }
}
