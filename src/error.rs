//! Error kinds surfaced by the feature engine.

use thiserror::Error;

use crate::events::TimestampMs;

/// Top-level error type for aggregation, storage and retrieval.
#[derive(Debug, Error)]
pub enum FeatureStoreError {
    #[error("late event {event_id} dropped: event_time {event_time} < threshold {threshold}")]
    LateDataDropped {
        event_id: String,
        event_time: TimestampMs,
        threshold: TimestampMs,
    },

    #[error("event {event_id} rejected: event_time {event_time} puts a window bound out of range")]
    EventTimeOutOfRange {
        event_id: String,
        event_time: TimestampMs,
    },

    #[error("feature {feature} missing for {entity}")]
    FeatureMissing { entity: String, feature: String },

    #[error("feature {feature} for {entity} is stale ({freshness_ms} ms old)")]
    StaleFeature {
        entity: String,
        feature: String,
        freshness_ms: i64,
    },

    #[error("{operation} did not complete within {deadline_ms} ms")]
    RetrievalTimeout {
        operation: &'static str,
        deadline_ms: u64,
    },

    #[error("parity violation: relative error {relative_error:.6} exceeds {threshold:.6}")]
    ParityViolation { relative_error: f64, threshold: f64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("report error: {0}")]
    Report(String),
}

impl FeatureStoreError {
    /// Errors that are counted or reported but never stop the pipeline.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LateDataDropped { .. }
                | Self::EventTimeOutOfRange { .. }
                | Self::StaleFeature { .. }
                | Self::ParityViolation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FeatureStoreError>;
