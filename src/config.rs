//! Process configuration. Loaded once at startup and read-only afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FeatureStoreError, Result};
use crate::features::{FeatureDefinition, FeatureRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureStoreConfig {
    /// Data directory (offline table)
    pub data_dir: PathBuf,
    pub watermark: WatermarkConfig,
    pub partitions: PartitionsConfig,
    pub aggregator: AggregatorConfig,
    pub materialization: MaterializationConfig,
    pub online: OnlineConfig,
    pub retrieval: RetrievalConfig,
    pub parity: ParityConfig,
    /// Parity report uplink to the observability collector
    pub report: ReportConfig,
    pub log: LogConfig,
    pub features: Vec<FeatureDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    /// How far the watermark trails the newest event time seen
    pub tolerance_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionsConfig {
    /// Number of partition workers
    pub count: usize,
    /// Bounded queue depth per worker
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Open windows per partition before late-event shedding starts
    pub max_open_windows: usize,
    /// Queued events behind a partition worker before late-event shedding starts
    pub max_backlog: usize,
    /// How far past the watermark the drop threshold moves while shedding
    pub load_shed_margin_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializationConfig {
    pub flush_interval_ms: u64,
    pub batch_size: usize,
    pub max_retries: u32,
    /// First retry delay; doubles each attempt
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    /// TTL for features with no definition
    pub default_ttl_ms: i64,
    /// Extra time past TTL before an unrefreshed entity is evicted
    pub eviction_grace_ms: i64,
    pub sweep_interval_ms: u64,
    pub shards: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParityConfig {
    /// Mean relative error above this fails the run (0.005 = 0.5%)
    pub threshold: f64,
    /// Denominator floor for relative error
    pub epsilon: f64,
    pub sample_size: usize,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for FeatureStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("featurestream"),
            watermark: WatermarkConfig::default(),
            partitions: PartitionsConfig::default(),
            aggregator: AggregatorConfig::default(),
            materialization: MaterializationConfig::default(),
            online: OnlineConfig::default(),
            retrieval: RetrievalConfig::default(),
            parity: ParityConfig::default(),
            report: ReportConfig::default(),
            log: LogConfig::default(),
            features: Vec::new(),
        }
    }
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: 10 * 60 * 1000,
        }
    }
}

impl Default for PartitionsConfig {
    fn default() -> Self {
        Self {
            count: 4,
            channel_capacity: 10_000,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_open_windows: 1_000_000,
            max_backlog: 8_000,
            load_shed_margin_ms: 60_000,
        }
    }
}

impl Default for MaterializationConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1_000,
            batch_size: 512,
            max_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 24 * 60 * 60 * 1000,
            eviction_grace_ms: 60 * 60 * 1000,
            sweep_interval_ms: 30_000,
            shards: 16,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { deadline_ms: 250 }
    }
}

impl Default for ParityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.005,
            epsilon: 1e-9,
            sample_size: 100,
            interval_secs: 60,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl FeatureStoreConfig {
    /// Load from a JSON file if present, otherwise defaults. A file that exists but does not
    /// parse, or whose feature set fails validation, is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<FeatureStoreConfig>(&data).map_err(|e| {
                FeatureStoreError::Config(format!("{}: {e}", path.display()))
            })?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.watermark.tolerance_ms < 0 {
            return Err(FeatureStoreError::Config("watermark tolerance must be >= 0".into()));
        }
        if self.partitions.count == 0 || self.partitions.channel_capacity == 0 {
            return Err(FeatureStoreError::Config(
                "partition count and channel capacity must be > 0".into(),
            ));
        }
        if self.online.shards == 0 || self.online.default_ttl_ms <= 0 {
            return Err(FeatureStoreError::Config(
                "online shards and default TTL must be > 0".into(),
            ));
        }
        if !(self.parity.threshold >= 0.0) || !(self.parity.epsilon > 0.0) {
            return Err(FeatureStoreError::Config(
                "parity threshold must be >= 0 and epsilon > 0".into(),
            ));
        }
        if self.materialization.batch_size == 0 {
            return Err(FeatureStoreError::Config("batch size must be > 0".into()));
        }
        FeatureRegistry::new(self.features.clone()).map(|_| ())
    }

    pub fn registry(&self) -> Result<FeatureRegistry> {
        FeatureRegistry::new(self.features.clone())
    }

    pub fn offline_path(&self) -> PathBuf {
        self.data_dir.join("offline.db")
    }
}
