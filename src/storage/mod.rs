//! Offline (append-only, SQLite) and online (in-memory, TTL) feature storage.

mod offline;
mod online;

pub use offline::{AppendResult, OfflineTable, TimeRange};
pub use online::{
    spawn_eviction_sweeper, FeatureValue, OnlineFeatureVector, OnlineStats, OnlineStore,
    PutOutcome,
};
