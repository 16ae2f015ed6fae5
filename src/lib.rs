//! featurestream: time-windowed behavioral features with point-in-time retrieval.
//!
//! Modular structure:
//! - [`events`]: Event, entity keys, stable partitioning
//! - [`features`]: Feature definitions, watermarks, window aggregation
//! - [`pipeline`]: Partition workers and the threaded stream pipeline
//! - [`materialize`]: Closed windows into the offline table and online store
//! - [`storage`]: SQLite offline table, sharded in-memory online store
//! - [`retrieval`]: Point-in-time (as-of) join engine
//! - [`parity`]: Online/offline parity checker
//! - [`logging`]: Structured JSON logging
//! - [`uplink`]: Parity report delivery

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod features;
pub mod logging;
pub mod materialize;
pub mod parity;
pub mod pipeline;
pub mod retrieval;
pub mod storage;
pub mod uplink;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FeatureStoreConfig;
pub use error::{FeatureStoreError, Result};
pub use events::{EntityId, EntityKey, Event, TimestampMs};
pub use features::{FeatureDefinition, FeatureRegistry, WindowAggregate, WindowAggregator};
pub use logging::StructuredLogger;
pub use materialize::Materializer;
pub use parity::{ParityChecker, ParityReport};
pub use pipeline::{PartitionWorker, PipelineSummary, StreamPipeline};
pub use retrieval::{FeatureLookup, PointInTimeJoin, PointInTimeVector};
pub use storage::{OfflineTable, OnlineStore};
pub use uplink::ParityReporter;
