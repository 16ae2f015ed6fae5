//! Materialization: closed window aggregates → offline table (append) + online store (upsert).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MaterializationConfig;
use crate::error::{FeatureStoreError, Result};
use crate::features::WindowAggregate;
use crate::storage::{OfflineTable, OnlineStore, PutOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeStats {
    pub batches: u64,
    pub offline_inserted: u64,
    /// Windows already present offline (redelivered aggregates).
    pub offline_duplicates: u64,
    pub online_applied: u64,
    /// Online writes older than the stored value.
    pub online_skipped: u64,
    pub retries: u64,
}

pub struct Materializer {
    offline: Arc<OfflineTable>,
    online: Arc<OnlineStore>,
    config: MaterializationConfig,
    stats: MaterializeStats,
}

fn is_transient(err: &FeatureStoreError) -> bool {
    matches!(err, FeatureStoreError::Storage(_) | FeatureStoreError::Io(_))
}

impl Materializer {
    pub fn new(
        offline: Arc<OfflineTable>,
        online: Arc<OnlineStore>,
        config: MaterializationConfig,
    ) -> Self {
        Self {
            offline,
            online,
            config,
            stats: MaterializeStats::default(),
        }
    }

    pub fn materialize(&mut self, aggregate: &WindowAggregate) -> Result<()> {
        self.materialize_batch(std::slice::from_ref(aggregate))
    }

    /// Offline first, with retry and exponential backoff on storage faults; the online store
    /// is only touched once the offline append has committed.
    pub fn materialize_batch(&mut self, aggregates: &[WindowAggregate]) -> Result<()> {
        if aggregates.is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        let appended = loop {
            match self.offline.append_batch(aggregates) {
                Ok(r) => break r,
                Err(e) if attempt < self.config.max_retries && is_transient(&e) => {
                    let delay = Duration::from_millis(
                        self.config
                            .retry_backoff_ms
                            .saturating_mul(1u64 << attempt.min(16)),
                    );
                    attempt += 1;
                    self.stats.retries += 1;
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "offline append failed, retrying");
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        };

        for agg in aggregates {
            match self.online.put(
                &agg.entity_key,
                &agg.feature_name,
                agg.value,
                agg.effective_time,
            ) {
                PutOutcome::Applied => self.stats.online_applied += 1,
                PutOutcome::Superseded => self.stats.online_skipped += 1,
            }
        }

        self.stats.batches += 1;
        self.stats.offline_inserted += appended.inserted as u64;
        self.stats.offline_duplicates += appended.duplicates as u64;
        debug!(
            aggregates = aggregates.len(),
            inserted = appended.inserted,
            duplicates = appended.duplicates,
            "materialized batch"
        );
        Ok(())
    }

    pub fn stats(&self) -> &MaterializeStats {
        &self.stats
    }
}
