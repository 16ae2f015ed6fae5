//! Feature definitions, watermarks and windowed aggregation.

mod accumulator;
mod aggregator;
mod definition;
mod watermark;

pub use accumulator::Accumulator;
pub use aggregator::{AggregatorStats, IngestOutcome, WindowAggregator};
pub use definition::{AggregationFn, FeatureDefinition, FeatureRegistry, WindowSpec};
pub use watermark::{GlobalWatermark, WatermarkState, WatermarkTracker};

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::events::{EntityKey, TimestampMs};

/// Value of one feature over one closed window. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub entity_key: EntityKey,
    pub feature_name: String,
    pub window_start: TimestampMs,
    pub window_end: TimestampMs,
    pub value: f64,
    /// Instant after which the value is valid for as-of queries (= `window_end`).
    pub effective_time: TimestampMs,
    pub partition: usize,
}

impl WindowAggregate {
    pub fn new(
        entity_key: EntityKey,
        feature_name: String,
        window_start: TimestampMs,
        window_end: TimestampMs,
        value: f64,
        partition: usize,
    ) -> Self {
        Self {
            entity_key,
            feature_name,
            window_start,
            window_end,
            value,
            effective_time: window_end,
            partition,
        }
    }

    /// `entity|feature|window_start`; unique per window.
    pub fn aggregate_id(&self) -> String {
        format!(
            "{}|{}|{}",
            self.entity_key, self.feature_name, self.window_start
        )
    }

    /// UTC date of `window_end`, the offline table's partition.
    pub fn event_date(&self) -> NaiveDate {
        event_date(self.window_end)
    }
}

/// UTC calendar date of `ts`, clamped to the representable range.
pub fn event_date(ts: TimestampMs) -> NaiveDate {
    match DateTime::from_timestamp_millis(ts) {
        Some(dt) => dt.date_naive(),
        None if ts > 0 => NaiveDate::MAX,
        None => NaiveDate::MIN,
    }
}
