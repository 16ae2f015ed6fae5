//! Threaded stream pipeline: one worker thread per partition, one materializer thread.
//! An event is routed once per feature key name it carries, to the partition owning that key,
//! so every key's windows live on exactly one worker.
//!
//! ```text
//! dispatch ──► [bounded queue] ──► PartitionWorker(p) ──┐
//!                                                        ├──► Materializer ──► offline + online
//! dispatch ──► [bounded queue] ──► PartitionWorker(q) ──┘
//! ```

mod worker;

pub use worker::PartitionWorker;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::{FeatureStoreConfig, MaterializationConfig};
use crate::error::{FeatureStoreError, Result};
use crate::events::{partition_for, Event, TimestampMs};
use crate::features::{AggregatorStats, FeatureRegistry, GlobalWatermark, WindowAggregate};
use crate::materialize::{MaterializeStats, Materializer};
use crate::storage::{OfflineTable, OnlineStore};

/// One routed copy of an event: the partition worker aggregates only `key_name` features.
#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub event: Arc<Event>,
    pub key_name: Arc<str>,
}

#[derive(Debug)]
pub enum WorkerMessage {
    Aggregates(Vec<WindowAggregate>),
    Watermark {
        partition: usize,
        watermark: TimestampMs,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub dispatched: u64,
    /// Routed copies sent to workers; one per feature key name an event carries.
    pub routed: u64,
    /// Events carrying no feature entity key.
    pub unroutable: u64,
    pub partitions: Vec<AggregatorStats>,
    pub materialized: MaterializeStats,
    /// Batches that still failed after retries.
    pub failed_batches: u64,
    pub global_watermark: Option<TimestampMs>,
}

struct MaterializerOutcome {
    stats: MaterializeStats,
    failed_batches: u64,
    global_watermark: Option<TimestampMs>,
}

pub struct StreamPipeline {
    senders: Vec<Sender<RoutedEvent>>,
    key_names: Vec<Arc<str>>,
    workers: Vec<JoinHandle<AggregatorStats>>,
    materializer: JoinHandle<MaterializerOutcome>,
    global_watermark: Arc<AtomicI64>,
    dispatched: AtomicU64,
    routed: AtomicU64,
    unroutable: AtomicU64,
}

impl StreamPipeline {
    pub fn start(
        config: &FeatureStoreConfig,
        registry: FeatureRegistry,
        offline: Arc<OfflineTable>,
        online: Arc<OnlineStore>,
    ) -> Result<Self> {
        let partitions = config.partitions.count;
        let capacity = config.partitions.channel_capacity;
        let (out_tx, out_rx) = bounded::<WorkerMessage>(capacity);
        let key_names: Vec<Arc<str>> =
            registry.key_names().iter().map(|k| Arc::from(k.as_str())).collect();

        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = bounded::<RoutedEvent>(capacity);
            let worker = PartitionWorker::new(partition, registry.clone(), config);
            let out = out_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("partition-{partition}"))
                .spawn(move || run_worker(worker, rx, out))?;
            senders.push(tx);
            workers.push(handle);
        }
        drop(out_tx);

        let global_watermark = Arc::new(AtomicI64::new(TimestampMs::MIN));
        let materializer = Materializer::new(offline, online, config.materialization.clone());
        let shared = Arc::clone(&global_watermark);
        let mat_config = config.materialization.clone();
        let materializer = std::thread::Builder::new()
            .name("materializer".into())
            .spawn(move || run_materializer(materializer, mat_config, partitions, out_rx, shared))?;

        info!(partitions, capacity, "stream pipeline started");
        Ok(Self {
            senders,
            key_names,
            workers,
            materializer,
            global_watermark,
            dispatched: AtomicU64::new(0),
            routed: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
        })
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Route to the owning partition of each feature entity key the event carries. Blocks
    /// while a target partition's queue is full.
    pub fn dispatch(&self, event: Event) -> Result<()> {
        let routes: Vec<(usize, &Arc<str>)> = self
            .key_names
            .iter()
            .filter_map(|name| {
                let key = event.entity_key(name)?;
                Some((partition_for(&key, self.senders.len()), name))
            })
            .collect();
        if routes.is_empty() {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = %event.event_id, "event without feature entity key skipped");
            return Ok(());
        }

        let event = Arc::new(event);
        for (partition, key_name) in routes {
            self.senders[partition]
                .send(RoutedEvent {
                    event: Arc::clone(&event),
                    key_name: Arc::clone(key_name),
                })
                .map_err(|_| FeatureStoreError::ChannelClosed("partition queue"))?;
            self.routed.fetch_add(1, Ordering::Relaxed);
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Min over partition watermarks once every partition has reported.
    pub fn global_watermark(&self) -> Option<TimestampMs> {
        match self.global_watermark.load(Ordering::Acquire) {
            TimestampMs::MIN => None,
            w => Some(w),
        }
    }

    /// Close the queues, drain workers, then flush and stop the materializer.
    pub fn shutdown(self) -> Result<PipelineSummary> {
        drop(self.senders);
        let mut partitions = Vec::with_capacity(self.workers.len());
        for handle in self.workers {
            let stats = handle
                .join()
                .map_err(|_| FeatureStoreError::ChannelClosed("partition worker panicked"))?;
            partitions.push(stats);
        }
        let outcome = self
            .materializer
            .join()
            .map_err(|_| FeatureStoreError::ChannelClosed("materializer panicked"))?;

        let summary = PipelineSummary {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            partitions,
            materialized: outcome.stats,
            failed_batches: outcome.failed_batches,
            global_watermark: outcome.global_watermark,
        };
        info!(
            dispatched = summary.dispatched,
            inserted = summary.materialized.offline_inserted,
            "stream pipeline stopped"
        );
        Ok(summary)
    }
}

fn run_worker(
    mut worker: PartitionWorker,
    rx: Receiver<RoutedEvent>,
    out: Sender<WorkerMessage>,
) -> AggregatorStats {
    let partition = worker.partition();
    let mut reported = TimestampMs::MIN;
    for routed in rx.iter() {
        worker.set_backlog(rx.len());
        let closed = match worker.handle_for(&routed.event, &routed.key_name) {
            Ok(closed) => closed,
            Err(e) => {
                debug!(partition, event_id = %routed.event.event_id, error = %e, "event rejected");
                continue;
            }
        };
        if !closed.is_empty() && out.send(WorkerMessage::Aggregates(closed)).is_err() {
            error!(partition, "materializer gone, worker exiting");
            break;
        }
        let watermark = worker.watermark();
        if watermark > reported {
            reported = watermark;
            if out
                .send(WorkerMessage::Watermark {
                    partition,
                    watermark,
                })
                .is_err()
            {
                break;
            }
        }
    }
    let open = worker.open_windows();
    if open > 0 {
        info!(partition, open, "discarding windows still open at shutdown");
    }
    worker.stats()
}

fn run_materializer(
    mut materializer: Materializer,
    config: MaterializationConfig,
    partitions: usize,
    rx: Receiver<WorkerMessage>,
    shared_watermark: Arc<AtomicI64>,
) -> MaterializerOutcome {
    let flush_every = Duration::from_millis(config.flush_interval_ms.max(1));
    let mut buffer: Vec<WindowAggregate> = Vec::with_capacity(config.batch_size);
    let mut global = GlobalWatermark::new(partitions);
    let mut failed_batches = 0u64;
    let mut last_flush = Instant::now();

    let mut flush = |buffer: &mut Vec<WindowAggregate>, materializer: &mut Materializer| {
        if buffer.is_empty() {
            return;
        }
        if let Err(e) = materializer.materialize_batch(buffer) {
            failed_batches += 1;
            error!(aggregates = buffer.len(), error = %e, "materialization failed, batch dropped");
        }
        buffer.clear();
    };

    loop {
        let wait = flush_every.saturating_sub(last_flush.elapsed());
        match rx.recv_timeout(wait) {
            Ok(WorkerMessage::Aggregates(aggs)) => {
                buffer.extend(aggs);
                if buffer.len() >= config.batch_size {
                    flush(&mut buffer, &mut materializer);
                    last_flush = Instant::now();
                }
            }
            Ok(WorkerMessage::Watermark {
                partition,
                watermark,
            }) => {
                global.observe(partition, watermark);
                if let Some(w) = global.current() {
                    shared_watermark.store(w, Ordering::Release);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                flush(&mut buffer, &mut materializer);
                last_flush = Instant::now();
            }
            Err(RecvTimeoutError::Disconnected) => {
                flush(&mut buffer, &mut materializer);
                break;
            }
        }
    }

    MaterializerOutcome {
        stats: materializer.stats().clone(),
        failed_batches,
        global_watermark: global.current(),
    }
}
