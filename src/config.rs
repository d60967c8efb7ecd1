use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Compression algorithms understood by the push exporter.
pub const COMPRESSION_ALGORITHMS: &[&str] = &["none", "gzip", "zstd", "zlib", "snappy"];

/// Top-level configuration for meterline.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this process in path-tracking entries and as the marker
    /// of everything it reports. Default: "node".
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Collector (ingestion side) configuration.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Agent-side store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Agent push exporter configuration.
    #[serde(default)]
    pub push: PushConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Run the collector. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address of the push/query HTTP endpoint. Default: ":8080".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub pull: PullConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Points kept per (role, marker) gauge series. Default: 100.
    #[serde(default = "default_gauge_series_max_size")]
    pub gauge_series_max_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullConfig {
    /// Interval between pull sweeps. Default: 60s.
    #[serde(default = "default_sixty_seconds", with = "humantime_serde")]
    pub period: Duration,

    /// Bound on a single node's pull. Default: 5s.
    #[serde(default = "default_pull_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Agents polled from startup, in addition to registered ones.
    #[serde(default)]
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Route path-tracking entries through the partitioned pipeline.
    /// When false they are written directly. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Total entries buffered across all partitions. Default: 4096.
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,

    /// Number of consumer tasks. Default: 4.
    #[serde(default = "default_consumers")]
    pub consumers: usize,

    /// How long shutdown waits for queued entries. Default: 5s.
    #[serde(default = "default_pipeline_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub batch: BatchStoreConfig,

    #[serde(default)]
    pub gauge: GaugeStoreConfig,

    #[serde(default)]
    pub counter: CounterStoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchStoreConfig {
    /// Interval between counter pushes. Default: 60s.
    #[serde(default = "default_sixty_seconds", with = "humantime_serde")]
    pub period: Duration,

    /// Remove counters once pushed so each push carries deltas.
    /// Default: true.
    #[serde(default = "default_true")]
    pub clear_on_collect: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GaugeStoreConfig {
    /// Interval between gauge flushes. Default: 4s.
    #[serde(default = "default_gauge_period", with = "humantime_serde")]
    pub period: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CounterStoreConfig {
    /// Maximum number of counters, 0 for unbounded. Default: 0.
    #[serde(default)]
    pub max_size: usize,

    /// Share of counters evicted when full. Default: 0.25.
    #[serde(default = "default_eviction_ratio")]
    pub eviction_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Push counters and gauges to a collector. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Collector URL (e.g. "http://collector:8080/").
    #[serde(default)]
    pub address: String,

    /// Body compression (none, gzip, zstd, zlib, snappy). Default: "gzip".
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_push_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address of /metrics and /healthz. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node_id() -> String {
    "node".to_string()
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    ":8080".to_string()
}

fn default_sixty_seconds() -> Duration {
    Duration::from_secs(60)
}

fn default_pull_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_ring_buffer_size() -> usize {
    4096
}

fn default_consumers() -> usize {
    4
}

fn default_pipeline_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_gauge_series_max_size() -> usize {
    100
}

fn default_gauge_period() -> Duration {
    Duration::from_secs(4)
}

fn default_eviction_ratio() -> f64 {
    0.25
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_push_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node_id: default_node_id(),
            collector: CollectorConfig::default(),
            store: StoreConfig::default(),
            push: PushConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_listen_addr(),
            pull: PullConfig::default(),
            pipeline: PipelineConfig::default(),
            gauge_series_max_size: default_gauge_series_max_size(),
        }
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            period: default_sixty_seconds(),
            timeout: default_pull_timeout(),
            agents: Vec::new(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ring_buffer_size: default_ring_buffer_size(),
            consumers: default_consumers(),
            shutdown_timeout: default_pipeline_shutdown_timeout(),
        }
    }
}

impl Default for BatchStoreConfig {
    fn default() -> Self {
        Self {
            period: default_sixty_seconds(),
            clear_on_collect: true,
        }
    }
}

impl Default for GaugeStoreConfig {
    fn default() -> Self {
        Self {
            period: default_gauge_period(),
        }
    }
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            max_size: 0,
            eviction_ratio: default_eviction_ratio(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            compression: default_compression(),
            timeout: default_push_timeout(),
            headers: HashMap::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file and validates it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Checks that the configuration has all required fields.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            bail!("node_id is required");
        }

        let pipeline = &self.collector.pipeline;
        if pipeline.consumers == 0 {
            bail!("collector.pipeline.consumers must be positive");
        }
        if pipeline.ring_buffer_size < pipeline.consumers {
            bail!(
                "collector.pipeline.ring_buffer_size ({}) must be at least consumers ({})",
                pipeline.ring_buffer_size,
                pipeline.consumers,
            );
        }
        if !pipeline.ring_buffer_size.is_power_of_two() {
            bail!(
                "collector.pipeline.ring_buffer_size must be a power of two, got {}",
                pipeline.ring_buffer_size,
            );
        }
        if pipeline.shutdown_timeout.is_zero() {
            bail!("collector.pipeline.shutdown_timeout must be positive");
        }

        if self.collector.pull.period.is_zero() {
            bail!("collector.pull.period must be positive");
        }
        if self.collector.pull.timeout.is_zero() {
            bail!("collector.pull.timeout must be positive");
        }
        if self.collector.gauge_series_max_size == 0 {
            bail!("collector.gauge_series_max_size must be positive");
        }

        if self.store.batch.period.is_zero() {
            bail!("store.batch.period must be positive");
        }
        if self.store.gauge.period.is_zero() {
            bail!("store.gauge.period must be positive");
        }
        let ratio = self.store.counter.eviction_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            bail!("store.counter.eviction_ratio must be in (0, 1], got {ratio}");
        }

        if self.push.enabled && self.push.address.is_empty() {
            bail!("push.address is required when push is enabled");
        }
        if !COMPRESSION_ALGORITHMS.contains(&self.push.compression.as_str()) {
            bail!(
                "push.compression must be one of {:?}, got {:?}",
                COMPRESSION_ALGORITHMS,
                self.push.compression,
            );
        }
        if self.push.timeout.is_zero() {
            bail!("push.timeout must be positive");
        }

        Ok(())
    }
}
