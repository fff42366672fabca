use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::pipeline::tolerance::LabelDiscovery;
use crate::pipeline::{GroupingMode, Settings};

/// Top-level configuration for a reducto run.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Reduction core configuration.
    #[serde(default)]
    pub reduction: ReductionConfig,

    /// Metric tables to reduce.
    #[serde(default)]
    pub tables: Vec<TableConfig>,

    /// Raw sample source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Output sink configuration.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Run metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Reduction core configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReductionConfig {
    /// Bucket width, in whole minutes. Default: 10m.
    #[serde(default = "default_bucket_width", with = "humantime_serde")]
    pub bucket_width: Duration,

    /// Number of earliest bucketed samples used for tolerance estimation. Default: 1000.
    #[serde(default = "default_estimation_prefix_size")]
    pub estimation_prefix_size: usize,

    /// Number of leading prefix entries scanned for labels. Default: 50.
    #[serde(default = "default_label_discovery_window")]
    pub label_discovery_window: usize,

    /// Label discovery mode. Default: window.
    #[serde(default)]
    pub label_discovery: LabelDiscoveryMode,

    /// Dedup baseline grouping. Default: label_only.
    #[serde(default)]
    pub grouping: GroupingMode,

    /// Tables reduced in parallel. Default: 1.
    #[serde(default = "default_max_concurrent_tables")]
    pub max_concurrent_tables: usize,

    /// Window length for tables without an override. Default: 7d.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub default_window: Duration,
}

/// Label discovery modes for tolerance estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelDiscoveryMode {
    /// Scan only the first `label_discovery_window` prefix entries.
    #[default]
    Window,
    /// Scan the whole estimation prefix.
    FullPrefix,
}

/// One metric table to reduce.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    /// Name used in logs, metrics and CLI filters.
    pub name: String,

    /// Raw table to read samples from.
    pub source_table: String,

    /// Column holding the metric sub-channel. Default: "label".
    #[serde(default = "default_label_column")]
    pub label_column: String,

    /// Table the emitted records are written to. Default: "<name>_reduced".
    #[serde(default)]
    pub target_table: Option<String>,

    /// Window length override.
    #[serde(default, with = "humantime_serde")]
    pub window: Option<Duration>,
}

impl TableConfig {
    pub fn target_table(&self) -> String {
        self.target_table
            .clone()
            .unwrap_or_else(|| format!("{}_reduced", self.name))
    }
}

/// Raw sample source configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SourceConfig {
    /// ClickHouse holding the raw telemetry tables.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// Output sink configuration. Exactly one sink must be enabled.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SinkConfig {
    /// ClickHouse sink configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseSinkConfig,

    /// HTTP export configuration (e.g., to Vector).
    #[serde(default)]
    pub http: HttpExportConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,
}

/// ClickHouse sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseSinkConfig {
    /// Enable the ClickHouse sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Connection settings.
    #[serde(flatten)]
    pub connection: ClickHouseConfig,

    /// Rows per INSERT statement. Default: 10000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// HTTP export configuration (e.g., for Vector).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to send data to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Records per request. Default: 512.
    #[serde(default = "default_http_batch_size")]
    pub batch_size: usize,

    /// Maximum duration of one request. Default: 30s.
    #[serde(default = "default_http_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// Run metrics configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus textfile written after each run (node_exporter textfile collector).
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bucket_width() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_estimation_prefix_size() -> usize {
    1000
}

fn default_label_discovery_window() -> usize {
    50
}

fn default_max_concurrent_tables() -> usize {
    1
}

fn default_window() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_label_column() -> String {
    "label".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_batch_size() -> usize {
    10000
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_batch_size() -> usize {
    512
}

fn default_http_export_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            reduction: ReductionConfig::default(),
            tables: Vec::new(),
            source: SourceConfig::default(),
            sink: SinkConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            bucket_width: default_bucket_width(),
            estimation_prefix_size: default_estimation_prefix_size(),
            label_discovery_window: default_label_discovery_window(),
            label_discovery: LabelDiscoveryMode::default(),
            grouping: GroupingMode::default(),
            max_concurrent_tables: default_max_concurrent_tables(),
            default_window: default_window(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for ClickHouseSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            connection: ClickHouseConfig::default(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            batch_size: default_http_batch_size(),
            export_timeout: default_http_export_timeout(),
            keep_alive: true,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.reduction.validate()?;

        if self.tables.is_empty() {
            bail!("at least one table must be configured");
        }

        if self.source.clickhouse.endpoint.is_empty() {
            bail!("source.clickhouse.endpoint is required");
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            if table.name.is_empty() {
                bail!("table name must not be empty");
            }
            if !names.insert(table.name.as_str()) {
                bail!("duplicate table name: {}", table.name);
            }
            if table.source_table.is_empty() {
                bail!("table {}: source_table is required", table.name);
            }
            if table.label_column.is_empty() {
                bail!("table {}: label_column must not be empty", table.name);
            }

            let window = self.window_for(table);
            self.reduction
                .check_window(window)
                .with_context(|| format!("table {}", table.name))?;
        }

        let ch = &self.sink.clickhouse;
        let http = &self.sink.http;
        match (ch.enabled, http.enabled) {
            (false, false) => bail!("one of sink.clickhouse or sink.http must be enabled"),
            (true, true) => bail!("only one of sink.clickhouse and sink.http may be enabled"),
            _ => {}
        }

        if ch.enabled {
            if ch.connection.endpoint.is_empty() {
                bail!("sink.clickhouse.endpoint is required when enabled");
            }
            if ch.batch_size == 0 {
                bail!("sink.clickhouse.batch_size must be positive");
            }
        }

        if http.enabled {
            if http.address.is_empty() {
                bail!("http address is required when enabled");
            }
            if http.batch_size == 0 {
                bail!("http batch_size must be positive when enabled");
            }

            let compression = &http.compression;
            match compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" | "snappy" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        Ok(())
    }

    /// Window length for `table`.
    pub fn window_for(&self, table: &TableConfig) -> Duration {
        table.window.unwrap_or(self.reduction.default_window)
    }
}

impl ReductionConfig {
    fn validate(&self) -> Result<()> {
        let width = self.bucket_width;
        if width.is_zero() {
            bail!("reduction.bucket_width must be positive");
        }
        if width.as_secs() % 60 != 0 || width.subsec_nanos() != 0 {
            bail!("reduction.bucket_width must be a whole number of minutes, got {width:?}");
        }

        if self.estimation_prefix_size == 0 {
            bail!("reduction.estimation_prefix_size must be positive");
        }
        if self.label_discovery_window == 0 {
            bail!("reduction.label_discovery_window must be positive");
        }
        if self.label_discovery_window > self.estimation_prefix_size {
            bail!(
                "reduction.label_discovery_window ({}) must not exceed estimation_prefix_size ({})",
                self.label_discovery_window,
                self.estimation_prefix_size
            );
        }

        if self.max_concurrent_tables == 0 {
            bail!("reduction.max_concurrent_tables must be positive");
        }

        self.check_window(self.default_window)
            .context("reduction.default_window")?;

        Ok(())
    }

    fn check_window(&self, window: Duration) -> Result<()> {
        if window.is_zero() {
            bail!("window must be positive");
        }
        if window.as_millis() % self.bucket_width.as_millis() != 0 {
            bail!(
                "window {:?} must be an exact multiple of bucket width {:?}",
                window,
                self.bucket_width
            );
        }
        Ok(())
    }

    /// Core settings derived from this configuration.
    pub fn settings(&self) -> Settings {
        let label_discovery = match self.label_discovery {
            LabelDiscoveryMode::Window => LabelDiscovery::Window(self.label_discovery_window),
            LabelDiscoveryMode::FullPrefix => LabelDiscovery::FullPrefix,
        };

        Settings {
            bucket_width: self.bucket_width,
            estimation_prefix_size: self.estimation_prefix_size,
            label_discovery,
            grouping: self.grouping,
        }
    }
}
