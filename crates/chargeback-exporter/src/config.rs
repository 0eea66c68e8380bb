//! Exporter configuration
//!
//! Layers defaults, an optional file named by `CHARGEBACK_CONFIG`, and
//! `CHARGEBACK_*` environment variables (sections separated by `__`, e.g.
//! `CHARGEBACK_BILLING__API_KEY`). The validated result is immutable and
//! shared process-wide behind an `Arc`.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chargeback_common::{ChargebackError, Result, DEFAULT_CURRENCY};
use serde::{Deserialize, Deserializer, Serialize};

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "CHARGEBACK_CONFIG";

/// Environment prefix for all settings
pub const ENV_PREFIX: &str = "CHARGEBACK";

/// Complete exporter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub billing: BillingSettings,
    pub metrics_api: MetricsApiSettings,
    pub store: StoreSettings,
    pub exporter: ServerSettings,
    pub aggregation: AggregationSettings,
    pub backfill: BackfillSettings,
    pub scheduler: SchedulerSettings,
}

impl ExporterConfig {
    /// Load configuration from `.env`, an optional file, and the environment
    pub fn load() -> Result<Self> {
        // Try to load .env file
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: ExporterConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ChargebackError::Config(format!("Failed to read configuration: {}", e)))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check invariants; fails fast on missing billing credentials
    pub fn validate(&self) -> Result<()> {
        if self.billing.api_key.trim().is_empty() || self.billing.api_secret.trim().is_empty() {
            return Err(ChargebackError::Config(
                "billing API key and secret are required (CHARGEBACK_BILLING__API_KEY / CHARGEBACK_BILLING__API_SECRET)"
                    .into(),
            ));
        }
        if self.billing.url.trim().is_empty() {
            return Err(ChargebackError::Config("billing.url must not be empty".into()));
        }
        if self.billing.max_attempts == 0 || self.backfill.max_attempts == 0 {
            return Err(ChargebackError::Config("max_attempts must be at least 1".into()));
        }

        let width = self.aggregation.bucket_width_secs;
        if width == 0 {
            return Err(ChargebackError::Config("aggregation.bucket_width_secs must be positive".into()));
        }
        if self.aggregation.live_horizon_secs < width {
            return Err(ChargebackError::Config(
                "aggregation.live_horizon_secs must cover at least one bucket".into(),
            ));
        }
        if self.backfill.block_duration_secs == 0 || self.backfill.block_duration_secs % width != 0 {
            return Err(ChargebackError::Config(format!(
                "backfill.block_duration_secs ({}) must be a positive multiple of the bucket width ({})",
                self.backfill.block_duration_secs, width
            )));
        }
        if self.scheduler.interval_secs == 0
            || self.scheduler.settle_interval_secs == 0
            || self.backfill.interval_secs == 0
        {
            return Err(ChargebackError::Config("cadence intervals must be positive".into()));
        }
        if self.exporter.metrics_port == self.exporter.health_port {
            return Err(ChargebackError::Config(
                "metrics and health endpoints need distinct ports".into(),
            ));
        }
        if !is_valid_metric_prefix(&self.exporter.metric_prefix) {
            return Err(ChargebackError::Config(format!(
                "invalid metric prefix: {:?}",
                self.exporter.metric_prefix
            )));
        }
        Ok(())
    }
}

fn is_valid_metric_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Billing API access
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
    /// Billing API base URL
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Lines requested per page
    pub page_size: u32,
    pub request_timeout_secs: u64,
    /// Attempts per page before a retryable error is surfaced
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl BillingSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            url: "https://api.confluent.cloud".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            page_size: 1000,
            request_timeout_secs: 30,
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl fmt::Debug for BillingSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BillingSettings")
            .field("url", &self.url)
            .field("api_key", &redact(&self.api_key))
            .field("api_secret", &redact(&self.api_secret))
            .field("page_size", &self.page_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff_ms", &self.initial_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .finish()
    }
}

/// Prometheus-compatible query API of the time-series store
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsApiSettings {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for MetricsApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsApiSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_deref().map(redact))
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

/// How backfilled blocks reach the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// TSDB blocks built by `promtool tsdb create-blocks-from openmetrics`
    Promtool,
    /// OpenMetrics files under `chargeback-backfill/blocks/` for an external importer
    Directory,
}

/// Target time-series store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Store base URL, probed at `/-/ready` before backfill
    pub url: Option<String>,
    /// Store on-disk data directory
    pub data_dir: PathBuf,
    /// Staging area for block files, must share a filesystem with `data_dir`
    pub staging_dir: Option<PathBuf>,
    pub sink: SinkKind,
    /// `promtool` binary, resolved on `PATH` when not absolute
    pub promtool: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: None,
            data_dir: PathBuf::from("./data/prometheus"),
            staging_dir: None,
            sink: SinkKind::Promtool,
            promtool: PathBuf::from("promtool"),
        }
    }
}

/// HTTP surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub metrics_port: u16,
    pub health_port: u16,
    pub metric_prefix: String,
    /// Attach bucket start timestamps to exposed samples
    pub expose_timestamps: bool,
    pub scrape_timeout_ms: u64,
}

impl ServerSettings {
    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.host, self.metrics_port)
    }

    pub fn health_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.host, self.health_port)
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_millis(self.scrape_timeout_ms)
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| ChargebackError::Config(format!("invalid listen address {}:{}: {}", host, port, e)))
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            metrics_port: 8000,
            health_port: 8001,
            metric_prefix: "chargeback".to_string(),
            expose_timestamps: true,
            scrape_timeout_ms: 2_000,
        }
    }
}

/// Bucketing and cache horizon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    pub bucket_width_secs: u64,
    /// Billing data lag tolerated before a closed bucket is sealed
    pub seal_delay_secs: u64,
    /// Sealed buckets older than this leave the scrape path for backfill
    pub live_horizon_secs: u64,
    pub default_currency: String,
    /// SKUs whose cost is reported with `cost_type="shared"`
    #[serde(deserialize_with = "string_or_list")]
    pub shared_skus: BTreeSet<String>,
}

impl AggregationSettings {
    pub fn bucket_width_ms(&self) -> i64 {
        secs_to_ms(self.bucket_width_secs)
    }

    pub fn seal_delay_ms(&self) -> i64 {
        secs_to_ms(self.seal_delay_secs)
    }

    pub fn live_horizon_ms(&self) -> i64 {
        secs_to_ms(self.live_horizon_secs)
    }
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            bucket_width_secs: 3_600,
            seal_delay_secs: 0,
            live_horizon_secs: 7_200,
            default_currency: DEFAULT_CURRENCY.to_string(),
            shared_skus: BTreeSet::new(),
        }
    }
}

/// Backfill cadence and block layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub block_duration_secs: u64,
    /// Cadences a block may fail before it is abandoned
    pub max_attempts: u32,
}

impl BackfillSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn block_duration_ms(&self) -> i64 {
        secs_to_ms(self.block_duration_secs)
    }
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
            block_duration_secs: 7_200,
            max_attempts: 5,
        }
    }
}

/// Polling loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub interval_secs: u64,
    /// History fetched on the first cycle
    pub initial_lookback_secs: u64,
    /// History re-fetched on the settlement cadence to pick up late billing lines
    pub settle_lookback_secs: u64,
    pub settle_interval_secs: u64,
    /// Time an in-flight fetch may keep running after shutdown is requested
    pub shutdown_grace_secs: u64,
}

impl SchedulerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn initial_lookback_ms(&self) -> i64 {
        secs_to_ms(self.initial_lookback_secs)
    }

    pub fn settle_lookback_ms(&self) -> i64 {
        secs_to_ms(self.settle_lookback_secs)
    }

    pub fn settle_interval_ms(&self) -> i64 {
        secs_to_ms(self.settle_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            initial_lookback_secs: 7 * 86_400,
            settle_lookback_secs: 7 * 86_400,
            settle_interval_secs: 3_600,
            shutdown_grace_secs: 10,
        }
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

/// Accept either a comma separated string (environment) or a list (file)
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    let items = match StringOrList::deserialize(deserializer)? {
        StringOrList::One(s) => s.split(',').map(str::to_string).collect::<Vec<_>>(),
        StringOrList::Many(v) => v,
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}
