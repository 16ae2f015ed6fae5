//! Feature definitions: window shape, aggregation function, TTL. Validated once at load.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{FeatureStoreError, Result};
use crate::events::{Event, TimestampMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowSpec {
    Tumbling { length_ms: i64 },
    /// Hop-aligned overlapping windows; each event lands in `length_ms / hop_ms` of them.
    Sliding { length_ms: i64, hop_ms: i64 },
    /// Closes after `gap_ms` of inactivity rather than on a fixed boundary.
    Session { gap_ms: i64 },
}

impl WindowSpec {
    /// Starts of every fixed window containing `t`, newest first. Empty for sessions.
    /// `None` when a window bound around `t` does not fit in an `i64`.
    pub fn window_starts(&self, t: TimestampMs) -> Option<Vec<TimestampMs>> {
        let (length, hop) = match *self {
            WindowSpec::Tumbling { length_ms } => (length_ms, length_ms),
            WindowSpec::Sliding { length_ms, hop_ms } => (length_ms, hop_ms),
            WindowSpec::Session { gap_ms } => return t.checked_add(gap_ms).map(|_| Vec::new()),
        };
        let mut starts = Vec::with_capacity((length / hop) as usize);
        let mut start = t.div_euclid(hop).checked_mul(hop)?;
        while start.checked_add(length)? > t {
            starts.push(start);
            start = start.checked_sub(hop)?;
        }
        Some(starts)
    }

    pub fn length_ms(&self) -> Option<i64> {
        match *self {
            WindowSpec::Tumbling { length_ms } | WindowSpec::Sliding { length_ms, .. } => {
                Some(length_ms)
            }
            WindowSpec::Session { .. } => None,
        }
    }

    pub fn is_session(&self) -> bool {
        matches!(self, WindowSpec::Session { .. })
    }

    fn validate(&self, feature: &str) -> Result<()> {
        let bad = |msg: &str| Err(FeatureStoreError::Config(format!("feature {feature}: {msg}")));
        match *self {
            WindowSpec::Tumbling { length_ms } if length_ms <= 0 => bad("window length must be > 0"),
            WindowSpec::Sliding { length_ms, hop_ms } => {
                if length_ms <= 0 || hop_ms <= 0 {
                    bad("window length and hop must be > 0")
                } else if hop_ms > length_ms {
                    bad("hop must not exceed window length")
                } else if length_ms % hop_ms != 0 {
                    bad("window length must be a multiple of hop")
                } else {
                    Ok(())
                }
            }
            WindowSpec::Session { gap_ms } if gap_ms <= 0 => bad("session gap must be > 0"),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum AggregationFn {
    Count,
    Sum { field: String },
    Avg { field: String },
    /// Events per second over the window span.
    Rate,
    DistinctCount { field: String },
}

impl AggregationFn {
    pub fn field(&self) -> Option<&str> {
        match self {
            AggregationFn::Sum { field }
            | AggregationFn::Avg { field }
            | AggregationFn::DistinctCount { field } => Some(field),
            AggregationFn::Count | AggregationFn::Rate => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDefinition {
    pub name: String,
    /// Single id name (`user_id`) or composite (`user_id+session_id`).
    pub entity_key_name: String,
    /// Only events of this type contribute; `None` accepts all.
    #[serde(default)]
    pub event_type: Option<String>,
    pub window: WindowSpec,
    pub aggregation: AggregationFn,
    pub ttl_ms: i64,
}

impl FeatureDefinition {
    pub fn accepts(&self, event: &Event) -> bool {
        self.event_type
            .as_deref()
            .map_or(true, |t| t == event.event_type)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FeatureStoreError::Config("feature name must not be empty".into()));
        }
        if self.entity_key_name.trim().is_empty() {
            return Err(FeatureStoreError::Config(format!(
                "feature {}: entity_key_name must not be empty",
                self.name
            )));
        }
        if self.ttl_ms <= 0 {
            return Err(FeatureStoreError::Config(format!(
                "feature {}: ttl_ms must be > 0",
                self.name
            )));
        }
        if matches!(self.aggregation.field(), Some(f) if f.trim().is_empty()) {
            return Err(FeatureStoreError::Config(format!(
                "feature {}: aggregation field must not be empty",
                self.name
            )));
        }
        self.window.validate(&self.name)
    }
}

/// Validated, read-only set of feature definitions for the process lifetime.
#[derive(Debug, Clone)]
pub struct FeatureRegistry {
    definitions: Arc<[FeatureDefinition]>,
    by_name: Arc<HashMap<String, usize>>,
    key_names: Arc<[String]>,
}

impl FeatureRegistry {
    pub fn new(definitions: Vec<FeatureDefinition>) -> Result<Self> {
        let mut seen = HashSet::new();
        for def in &definitions {
            def.validate()?;
            if !seen.insert(def.name.clone()) {
                return Err(FeatureStoreError::Config(format!(
                    "duplicate feature name {}",
                    def.name
                )));
            }
        }
        let by_name = definitions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();
        let mut key_names: Vec<String> = Vec::new();
        for def in &definitions {
            if !key_names.contains(&def.entity_key_name) {
                key_names.push(def.entity_key_name.clone());
            }
        }
        Ok(Self {
            definitions: definitions.into(),
            by_name: Arc::new(by_name),
            key_names: key_names.into(),
        })
    }

    pub fn definitions(&self) -> &[FeatureDefinition] {
        &self.definitions
    }

    pub fn get(&self, name: &str) -> Option<&FeatureDefinition> {
        self.by_name.get(name).map(|&i| &self.definitions[i])
    }

    pub fn for_entity<'a>(
        &'a self,
        entity_key_name: &'a str,
    ) -> impl Iterator<Item = &'a FeatureDefinition> + 'a {
        self.definitions
            .iter()
            .filter(move |d| d.entity_key_name == entity_key_name)
    }

    /// Distinct entity key names across all features, in definition order.
    pub fn key_names(&self) -> &[String] {
        &self.key_names
    }

    pub fn ttl_ms(&self, feature: &str) -> Option<i64> {
        self.get(feature).map(|d| d.ttl_ms)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_def(name: &str, window: WindowSpec) -> FeatureDefinition {
        FeatureDefinition {
            name: name.into(),
            entity_key_name: "user_id".into(),
            event_type: None,
            window,
            aggregation: AggregationFn::Count,
            ttl_ms: 60_000,
        }
    }

    #[test]
    fn tumbling_assigns_one_window() {
        let w = WindowSpec::Tumbling { length_ms: 60_000 };
        assert_eq!(w.window_starts(0), Some(vec![0]));
        assert_eq!(w.window_starts(59_999), Some(vec![0]));
        assert_eq!(w.window_starts(60_000), Some(vec![60_000]));
        assert_eq!(w.window_starts(-1), Some(vec![-60_000]));
    }

    #[test]
    fn sliding_assigns_length_over_hop_windows() {
        let w = WindowSpec::Sliding {
            length_ms: 60_000,
            hop_ms: 15_000,
        };
        let starts = w.window_starts(70_000).unwrap();
        assert_eq!(starts, vec![60_000, 45_000, 30_000, 15_000]);
        for s in starts {
            assert!(s <= 70_000 && 70_000 < s + 60_000);
        }
    }

    #[test]
    fn window_bounds_past_i64_range_are_rejected() {
        let tumbling = WindowSpec::Tumbling { length_ms: 60_000 };
        assert_eq!(tumbling.window_starts(i64::MAX - 10), None);
        assert_eq!(tumbling.window_starts(i64::MIN), None);
        let session = WindowSpec::Session { gap_ms: 1_000 };
        assert_eq!(session.window_starts(i64::MAX - 10), None);
        assert_eq!(session.window_starts(0), Some(Vec::new()));
    }

    #[test]
    fn key_names_are_distinct_in_definition_order() {
        let mut by_product = count_def("views", WindowSpec::Tumbling { length_ms: 1_000 });
        by_product.entity_key_name = "product_id".into();
        let registry = FeatureRegistry::new(vec![
            count_def("a", WindowSpec::Tumbling { length_ms: 1_000 }),
            by_product,
            count_def("b", WindowSpec::Session { gap_ms: 1_000 }),
        ])
        .unwrap();
        assert_eq!(registry.key_names(), ["user_id", "product_id"]);
    }

    #[test]
    fn rejects_invalid_definitions() {
        let bad_hop = count_def(
            "f",
            WindowSpec::Sliding {
                length_ms: 60_000,
                hop_ms: 7_000,
            },
        );
        assert!(FeatureRegistry::new(vec![bad_hop]).is_err());

        let dup = count_def("f", WindowSpec::Tumbling { length_ms: 1_000 });
        assert!(FeatureRegistry::new(vec![dup.clone(), dup]).is_err());

        let mut no_field = count_def("g", WindowSpec::Tumbling { length_ms: 1_000 });
        no_field.aggregation = AggregationFn::Sum { field: " ".into() };
        assert!(FeatureRegistry::new(vec![no_field]).is_err());

        let mut no_ttl = count_def("h", WindowSpec::Session { gap_ms: 1_000 });
        no_ttl.ttl_ms = 0;
        assert!(FeatureRegistry::new(vec![no_ttl]).is_err());
    }

    #[test]
    fn definitions_deserialize_from_tagged_json() {
        let raw = r#"{
            "name": "user_spend_1h",
            "entity_key_name": "user_id",
            "event_type": "purchase",
            "window": {"kind": "sliding", "length_ms": 3600000, "hop_ms": 600000},
            "aggregation": {"fn": "sum", "field": "amount"},
            "ttl_ms": 7200000
        }"#;
        let def: FeatureDefinition = serde_json::from_str(raw).unwrap();
        assert_eq!(def.aggregation.field(), Some("amount"));
        let registry = FeatureRegistry::new(vec![def]).unwrap();
        assert_eq!(registry.ttl_ms("user_spend_1h"), Some(7_200_000));
        assert_eq!(registry.for_entity("user_id").count(), 1);
        assert_eq!(registry.for_entity("session_id").count(), 0);
    }
}
