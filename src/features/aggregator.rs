//! Windowed aggregation: events → open window accumulators → immutable aggregates once the
//! watermark passes `window_end`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::accumulator::Accumulator;
use super::{FeatureRegistry, WindowAggregate, WindowSpec};
use crate::config::AggregatorConfig;
use crate::error::{FeatureStoreError, Result};
use crate::events::{EntityKey, Event, TimestampMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted { windows_updated: usize },
    Duplicate,
    /// No feature definition applies to this event.
    Irrelevant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub events_accepted: u64,
    pub duplicates: u64,
    pub dropped_late: u64,
    /// Dropped because the late threshold was widened under load.
    pub shed: u64,
    /// Rejected because a window bound around `event_time` overflows.
    pub out_of_range: u64,
    pub windows_emitted: u64,
    pub open_windows: u64,
}

/// Ordered by `window_end` first so closure pops from the front.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct WindowKey {
    window_end: TimestampMs,
    feature: usize,
    entity: EntityKey,
    window_start: TimestampMs,
}

#[derive(Debug, Clone)]
struct OpenSession {
    start: TimestampMs,
    last_event_time: TimestampMs,
    acc: Accumulator,
}

impl OpenSession {
    fn end(&self, gap_ms: i64) -> TimestampMs {
        self.last_event_time.saturating_add(gap_ms)
    }

    fn touches(&self, t: TimestampMs, gap_ms: i64) -> bool {
        t.saturating_add(gap_ms) > self.start && t < self.end(gap_ms)
    }
}

/// Window state for one partition. Owned by exactly one worker; no internal locking.
pub struct WindowAggregator {
    partition: usize,
    registry: FeatureRegistry,
    config: AggregatorConfig,
    windows: BTreeMap<WindowKey, Accumulator>,
    sessions: HashMap<(usize, EntityKey), Vec<OpenSession>>,
    /// `(key name scope, event_id)` of accepted events not yet behind the watermark.
    seen: HashMap<(String, String), TimestampMs>,
    watermark: TimestampMs,
    backlog: usize,
    stats: AggregatorStats,
}

impl WindowAggregator {
    pub fn new(partition: usize, registry: FeatureRegistry, config: AggregatorConfig) -> Self {
        Self {
            partition,
            registry,
            config,
            windows: BTreeMap::new(),
            sessions: HashMap::new(),
            seen: HashMap::new(),
            watermark: TimestampMs::MIN,
            backlog: 0,
            stats: AggregatorStats::default(),
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len() + self.sessions.values().map(Vec::len).sum::<usize>()
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            open_windows: self.open_windows() as u64,
            ..self.stats.clone()
        }
    }

    /// Events queued behind this aggregator, as last reported by its worker.
    pub fn set_backlog(&mut self, backlog: usize) {
        self.backlog = backlog;
    }

    /// Events strictly below this are dropped. Widened past the watermark while the open
    /// window count or the event backlog is over budget.
    pub fn late_threshold(&self, watermark: TimestampMs) -> TimestampMs {
        if self.open_windows() > self.config.max_open_windows
            || self.backlog > self.config.max_backlog
        {
            watermark.saturating_add(self.config.load_shed_margin_ms)
        } else {
            watermark
        }
    }

    /// Fold `event` into every open window it belongs to, given the partition's current
    /// watermark. Late events are counted and returned as `LateDataDropped`.
    pub fn ingest(&mut self, event: &Event, watermark: TimestampMs) -> Result<IngestOutcome> {
        self.ingest_scoped(event, None, watermark)
    }

    /// Like [`ingest`](Self::ingest), restricted to features keyed on `key_name`. Duplicate
    /// detection is per key name, so one event may arrive once for each key it is routed by.
    pub fn ingest_scoped(
        &mut self,
        event: &Event,
        key_name: Option<&str>,
        watermark: TimestampMs,
    ) -> Result<IngestOutcome> {
        let seen_key = (key_name.unwrap_or_default().to_string(), event.event_id.clone());
        if self.seen.contains_key(&seen_key) {
            self.stats.duplicates += 1;
            trace!(partition = self.partition, event_id = %event.event_id, "duplicate event");
            return Ok(IngestOutcome::Duplicate);
        }

        let threshold = self.late_threshold(watermark);
        if event.event_time < threshold {
            if event.event_time < watermark {
                self.stats.dropped_late += 1;
            } else {
                self.stats.shed += 1;
            }
            return Err(FeatureStoreError::LateDataDropped {
                event_id: event.event_id.clone(),
                event_time: event.event_time,
                threshold,
            });
        }

        // Resolve every window first so a rejected event leaves no partial state.
        let mut targets = Vec::new();
        for (idx, def) in self.registry.definitions().iter().enumerate() {
            if key_name.is_some_and(|k| k != def.entity_key_name) {
                continue;
            }
            if !def.accepts(event) || !Accumulator::contributes(&def.aggregation, event) {
                continue;
            }
            let Some(entity) = event.entity_key(&def.entity_key_name) else {
                continue;
            };
            let Some(starts) = def.window.window_starts(event.event_time) else {
                self.stats.out_of_range += 1;
                return Err(FeatureStoreError::EventTimeOutOfRange {
                    event_id: event.event_id.clone(),
                    event_time: event.event_time,
                });
            };
            targets.push((idx, entity, starts));
        }

        let mut updated = 0;
        for (idx, entity, starts) in targets {
            let def = &self.registry.definitions()[idx];
            match def.window {
                WindowSpec::Session { gap_ms } => {
                    let sessions = self.sessions.entry((idx, entity)).or_default();
                    update_sessions(sessions, event, gap_ms, &def.aggregation);
                    updated += 1;
                }
                window => {
                    let length = window.length_ms().unwrap_or_default();
                    for start in starts {
                        let key = WindowKey {
                            window_end: start + length,
                            feature: idx,
                            entity: entity.clone(),
                            window_start: start,
                        };
                        self.windows
                            .entry(key)
                            .or_insert_with(|| Accumulator::new(&def.aggregation))
                            .update(&def.aggregation, event);
                        updated += 1;
                    }
                }
            }
        }

        if updated == 0 {
            return Ok(IngestOutcome::Irrelevant);
        }
        self.seen.insert(seen_key, event.event_time);
        self.stats.events_accepted += 1;
        Ok(IngestOutcome::Accepted {
            windows_updated: updated,
        })
    }

    /// Close and emit every window with `window_end <= watermark`, oldest first. Each window
    /// is emitted once and its accumulator dropped.
    pub fn advance_to(&mut self, watermark: TimestampMs) -> Vec<WindowAggregate> {
        if watermark <= self.watermark {
            return Vec::new();
        }
        self.watermark = watermark;

        let mut emitted = Vec::new();
        while let Some(entry) = self.windows.first_entry() {
            if entry.key().window_end > watermark {
                break;
            }
            let (key, acc) = entry.remove_entry();
            let def = &self.registry.definitions()[key.feature];
            emitted.push(WindowAggregate::new(
                key.entity,
                def.name.clone(),
                key.window_start,
                key.window_end,
                acc.finish(key.window_end - key.window_start),
                self.partition,
            ));
        }

        let registry = &self.registry;
        let partition = self.partition;
        self.sessions.retain(|(idx, entity), open| {
            let def = &registry.definitions()[*idx];
            let WindowSpec::Session { gap_ms } = def.window else {
                return false;
            };
            open.retain(|s| {
                let end = s.end(gap_ms);
                if end > watermark {
                    return true;
                }
                emitted.push(WindowAggregate::new(
                    entity.clone(),
                    def.name.clone(),
                    s.start,
                    end,
                    s.acc.finish(end - s.start),
                    partition,
                ));
                false
            });
            !open.is_empty()
        });

        self.seen.retain(|_, t| *t >= watermark);
        emitted.sort_by(|a, b| {
            (a.window_end, &a.feature_name, &a.entity_key)
                .cmp(&(b.window_end, &b.feature_name, &b.entity_key))
        });
        self.stats.windows_emitted += emitted.len() as u64;
        if !emitted.is_empty() {
            debug!(
                partition = self.partition,
                watermark,
                emitted = emitted.len(),
                open = self.open_windows(),
                "closed windows"
            );
        }
        emitted
    }
}

fn update_sessions(
    sessions: &mut Vec<OpenSession>,
    event: &Event,
    gap_ms: i64,
    aggregation: &super::AggregationFn,
) {
    let t = event.event_time;
    let mut hits: Vec<usize> = sessions
        .iter()
        .enumerate()
        .filter(|(_, s)| s.touches(t, gap_ms))
        .map(|(i, _)| i)
        .collect();

    let Some(first) = hits.first().copied() else {
        let mut acc = Accumulator::new(aggregation);
        acc.update(aggregation, event);
        sessions.push(OpenSession {
            start: t,
            last_event_time: t,
            acc,
        });
        return;
    };

    // An out-of-order event can bridge two sessions; fold the later ones into the first.
    hits.reverse();
    for idx in hits.into_iter().filter(|&i| i != first) {
        let other = sessions.swap_remove(idx);
        let target = &mut sessions[first];
        target.start = target.start.min(other.start);
        target.last_event_time = target.last_event_time.max(other.last_event_time);
        target.acc.merge(other.acc);
    }
    let target = &mut sessions[first];
    target.start = target.start.min(t);
    target.last_event_time = target.last_event_time.max(t);
    target.acc.update(aggregation, event);
}
