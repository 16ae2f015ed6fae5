//! Inbound events, entity keys and stable partition assignment.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// Separator between member names of a composite entity key (`user_id+session_id`).
pub const COMPOSITE_NAME_SEP: char = '+';
/// Separator between member values of a composite entity key (`u1|s9`).
pub const COMPOSITE_VALUE_SEP: char = '|';

/// One named id carried by an event, e.g. `user_id=u1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub name: String,
    pub value: String,
}

impl EntityId {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Key a feature is aggregated and served under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub name: String,
    pub value: String,
}

impl EntityKey {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Stable 64-bit hash of `name=value` (first 8 bytes of SHA-256).
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"=");
        hasher.update(self.value.as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

impl From<&EntityId> for EntityKey {
    fn from(id: &EntityId) -> Self {
        Self::new(id.name.clone(), id.value.clone())
    }
}

/// Partition index for a key; every event of a key lands on the same worker.
pub fn partition_for(key: &EntityKey, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    (key.stable_hash() % partitions as u64) as usize
}

/// Immutable inbound event. Identified by `event_id`; redeliveries carry the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_time: TimestampMs,
    pub entity_ids: Vec<EntityId>,
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(event_time: TimestampMs, event_type: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_time,
            entity_ids: Vec::new(),
            event_type: event_type.into(),
            payload: serde_json::Map::new(),
        }
    }

    pub fn with_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_entity(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.entity_ids.push(EntityId::new(name, value));
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    /// First entity id carried by the event.
    pub fn primary_key(&self) -> Option<EntityKey> {
        self.entity_ids.first().map(EntityKey::from)
    }

    pub fn entity_value(&self, name: &str) -> Option<&str> {
        self.entity_ids
            .iter()
            .find(|id| id.name == name)
            .map(|id| id.value.as_str())
    }

    /// Resolve a possibly composite key name. `None` when any member id is absent.
    pub fn entity_key(&self, key_name: &str) -> Option<EntityKey> {
        let mut values = Vec::new();
        for member in key_name.split(COMPOSITE_NAME_SEP) {
            values.push(self.entity_value(member.trim())?);
        }
        let sep = COMPOSITE_VALUE_SEP.to_string();
        Some(EntityKey::new(key_name, values.join(&sep)))
    }

    /// Numeric payload field: JSON numbers, or strings that parse as f64.
    pub fn numeric_field(&self, field: &str) -> Option<f64> {
        match self.payload.get(field)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Payload field rendered as a distinct-count token. Null and missing yield `None`.
    pub fn field_token(&self, field: &str) -> Option<String> {
        match self.payload.get(field)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}
