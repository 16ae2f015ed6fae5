//! Event-time watermarks, one state per partition, owned by that partition's worker.

use serde::{Deserialize, Serialize};

use crate::events::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkState {
    pub max_event_time_seen: Option<TimestampMs>,
    /// `max_event_time_seen - tolerance`; `i64::MIN` until the first event.
    pub watermark: TimestampMs,
}

impl Default for WatermarkState {
    fn default() -> Self {
        Self {
            max_event_time_seen: None,
            watermark: TimestampMs::MIN,
        }
    }
}

/// Arena of per-partition watermark states indexed by partition id.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    tolerance_ms: i64,
    states: Vec<WatermarkState>,
}

impl WatermarkTracker {
    pub fn new(tolerance_ms: i64, partitions: usize) -> Self {
        Self {
            tolerance_ms,
            states: vec![WatermarkState::default(); partitions.max(1)],
        }
    }

    /// Record `event_time` for `partition` and return its (never decreasing) watermark.
    pub fn advance(&mut self, partition: usize, event_time: TimestampMs) -> TimestampMs {
        if partition >= self.states.len() {
            self.states.resize(partition + 1, WatermarkState::default());
        }
        let state = &mut self.states[partition];
        if state.max_event_time_seen.map_or(true, |max| event_time > max) {
            state.max_event_time_seen = Some(event_time);
            let candidate = event_time.saturating_sub(self.tolerance_ms);
            if candidate > state.watermark {
                state.watermark = candidate;
            }
        }
        state.watermark
    }

    pub fn watermark(&self, partition: usize) -> TimestampMs {
        self.states
            .get(partition)
            .map_or(TimestampMs::MIN, |s| s.watermark)
    }

    pub fn state(&self, partition: usize) -> Option<&WatermarkState> {
        self.states.get(partition)
    }

    /// Minimum over all partitions this tracker owns.
    pub fn global_watermark(&self) -> TimestampMs {
        self.states
            .iter()
            .map(|s| s.watermark)
            .min()
            .unwrap_or(TimestampMs::MIN)
    }

    pub fn tolerance_ms(&self) -> i64 {
        self.tolerance_ms
    }
}

/// Global watermark assembled from watermarks reported by partition workers.
#[derive(Debug, Clone, Default)]
pub struct GlobalWatermark {
    reported: Vec<Option<TimestampMs>>,
}

impl GlobalWatermark {
    pub fn new(partitions: usize) -> Self {
        Self {
            reported: vec![None; partitions],
        }
    }

    pub fn observe(&mut self, partition: usize, watermark: TimestampMs) {
        if partition >= self.reported.len() {
            self.reported.resize(partition + 1, None);
        }
        let slot = &mut self.reported[partition];
        *slot = Some(slot.map_or(watermark, |w| w.max(watermark)));
    }

    /// Min over every partition; `None` until all have reported, so it never runs ahead of a
    /// silent partition.
    pub fn current(&self) -> Option<TimestampMs> {
        let mut min = None;
        for w in &self.reported {
            let w = (*w)?;
            min = Some(min.map_or(w, |m: TimestampMs| m.min(w)));
        }
        min
    }
}
