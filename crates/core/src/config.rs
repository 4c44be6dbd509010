//! Application configuration. Loaded from environment variables with the
//! prefix `ADSERVE__` and an optional TOML config file.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub counter_store: CounterStoreConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub targeting: TargetingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub ctr: CtrConfig,
    #[serde(default)]
    pub bidding: BiddingConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Externally reachable base URL embedded in tracking links.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_read_timeout_secs() -> u64 {
    5
}
fn default_write_timeout_secs() -> u64 {
    10
}
fn default_public_url() -> String {
    "http://localhost:8787".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            public_url: default_public_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CounterStoreConfig {
    #[serde(default = "default_counter_url")]
    pub url: String,
}

fn default_counter_url() -> String {
    "redis://localhost:6379".to_string()
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            url: default_counter_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Path to the JSON catalog bootstrap file.
    #[serde(default = "default_catalog_path")]
    pub path: String,
    /// Seconds between reloads; 0 disables the periodic reload task.
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
}

fn default_catalog_path() -> String {
    "catalog.json".to_string()
}
fn default_reload_interval_secs() -> u64 {
    30
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            reload_interval_secs: default_reload_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_analytics_url")]
    pub url: String,
    #[serde(default = "default_analytics_db")]
    pub database: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_analytics_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_analytics_db() -> String {
    "adserve".to_string()
}
fn default_batch_size() -> usize {
    1_000
}
fn default_flush_interval_ms() -> u64 {
    2_000
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            url: default_analytics_url(),
            database: default_analytics_db(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetingConfig {
    /// Path to a MaxMind GeoIP database; empty disables geo resolution.
    #[serde(default)]
    pub geoip_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Collect a structured selection trace on every request.
    #[serde(default)]
    pub debug_trace: bool,
    /// Comma-separated tier list, highest priority first.
    #[serde(default = "default_priority_order")]
    pub priority_order: String,
    #[serde(default = "default_frequency_cap")]
    pub default_frequency_cap: i64,
}

fn default_priority_order() -> String {
    "high,medium,low".to_string()
}
fn default_frequency_cap() -> i64 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debug_trace: false,
            priority_order: default_priority_order(),
            default_frequency_cap: default_frequency_cap(),
        }
    }
}

impl EngineConfig {
    pub fn priority_tiers(&self) -> Vec<String> {
        self.priority_order
            .split(',')
            .map(|tier| tier.trim().to_lowercase())
            .filter(|tier| !tier.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_secret")]
    pub secret: String,
    #[serde(default = "default_token_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_token_secret() -> String {
    "adserve-dev-secret".to_string()
}
fn default_token_ttl_secs() -> u64 {
    1_800
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: default_token_secret(),
            ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl TokenConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_capacity")]
    pub capacity: f64,
    /// Tokens added per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
}

fn default_rate_limit_enabled() -> bool {
    true
}
fn default_rate_limit_capacity() -> f64 {
    100.0
}
fn default_refill_rate() -> f64 {
    10.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            capacity: default_rate_limit_capacity(),
            refill_rate: default_refill_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CtrConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub predictor_url: String,
    #[serde(default = "default_ctr_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_ctr_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_ctr_timeout_ms() -> u64 {
    100
}
fn default_ctr_cache_ttl_secs() -> u64 {
    300
}

impl Default for CtrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            predictor_url: String::new(),
            timeout_ms: default_ctr_timeout_ms(),
            cache_ttl_secs: default_ctr_cache_ttl_secs(),
        }
    }
}

impl CtrConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BiddingConfig {
    /// Hard per-bidder deadline for programmatic callouts.
    #[serde(default = "default_bid_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_bid_timeout_ms() -> u64 {
    800
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_bid_timeout_ms(),
        }
    }
}

impl BiddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// PID controller gains for feedback-paced line items.
#[derive(Debug, Clone, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
}

fn default_kp() -> f64 {
    0.3
}
fn default_ki() -> f64 {
    0.05
}
fn default_kd() -> f64 {
    0.1
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ADSERVE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8787);
        assert_eq!(cfg.token.ttl(), Duration::from_secs(1_800));
        assert_eq!(cfg.bidding.timeout(), Duration::from_millis(800));
        assert_eq!(cfg.ctr.timeout(), Duration::from_millis(100));
        assert!((cfg.pacing.kp - 0.3).abs() < f64::EPSILON);
        assert!(cfg.rate_limit.enabled);
        assert!(!cfg.engine.debug_trace);
    }

    #[test]
    fn test_priority_tiers_parse() {
        let engine = EngineConfig {
            priority_order: "High, medium ,low,".to_string(),
            ..EngineConfig::default()
        };
        assert_eq!(engine.priority_tiers(), vec!["high", "medium", "low"]);
    }
}
