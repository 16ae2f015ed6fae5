//! One partition's event loop state: watermark + windows.

use tracing::{debug, warn};

use crate::config::FeatureStoreConfig;
use crate::error::{FeatureStoreError, Result};
use crate::events::{Event, TimestampMs};
use crate::features::{
    AggregatorStats, FeatureRegistry, IngestOutcome, WatermarkTracker, WindowAggregate,
    WindowAggregator,
};

const LATE_WARN_EVERY: u64 = 1_000;

/// Owns the watermark and window state for a single partition. Not shared between threads.
pub struct PartitionWorker {
    partition: usize,
    tracker: WatermarkTracker,
    aggregator: WindowAggregator,
}

impl PartitionWorker {
    pub fn new(partition: usize, registry: FeatureRegistry, config: &FeatureStoreConfig) -> Self {
        Self {
            partition,
            tracker: WatermarkTracker::new(config.watermark.tolerance_ms, partition + 1),
            aggregator: WindowAggregator::new(partition, registry, config.aggregator.clone()),
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn watermark(&self) -> TimestampMs {
        self.tracker.watermark(self.partition)
    }

    pub fn stats(&self) -> AggregatorStats {
        self.aggregator.stats()
    }

    pub fn open_windows(&self) -> usize {
        self.aggregator.open_windows()
    }

    /// Events waiting in this worker's queue; feeds load shedding.
    pub fn set_backlog(&mut self, backlog: usize) {
        self.aggregator.set_backlog(backlog);
    }

    /// Ingest against the current watermark, then move the watermark and close whatever it
    /// passed. A late event leaves the watermark where it was and surfaces `LateDataDropped`.
    pub fn handle(&mut self, event: &Event) -> Result<Vec<WindowAggregate>> {
        self.handle_scoped(event, None)
    }

    /// [`handle`](Self::handle) for only the features keyed on `key_name`, for events routed
    /// to this partition by that key.
    pub fn handle_for(&mut self, event: &Event, key_name: &str) -> Result<Vec<WindowAggregate>> {
        self.handle_scoped(event, Some(key_name))
    }

    fn handle_scoped(
        &mut self,
        event: &Event,
        key_name: Option<&str>,
    ) -> Result<Vec<WindowAggregate>> {
        let watermark = self.watermark();
        match self.aggregator.ingest_scoped(event, key_name, watermark) {
            Ok(IngestOutcome::Duplicate) => {
                debug!(partition = self.partition, event_id = %event.event_id, "duplicate dropped");
            }
            Ok(_) => {}
            Err(e @ FeatureStoreError::LateDataDropped { .. }) => {
                let stats = self.aggregator.stats();
                let late = stats.dropped_late + stats.shed;
                if late % LATE_WARN_EVERY == 0 {
                    warn!(
                        partition = self.partition,
                        watermark,
                        dropped_late = stats.dropped_late,
                        shed = stats.shed,
                        "late events dropped"
                    );
                }
                return Err(e);
            }
            Err(e @ FeatureStoreError::EventTimeOutOfRange { .. }) => {
                warn!(
                    partition = self.partition,
                    event_id = %event.event_id,
                    event_time = event.event_time,
                    out_of_range = self.aggregator.stats().out_of_range,
                    "event time out of range"
                );
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        let advanced = self.tracker.advance(self.partition, event.event_time);
        Ok(self.aggregator.advance_to(advanced))
    }
}
