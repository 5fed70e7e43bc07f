use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `PHOENIX_CONFIG` or
/// `~/.phoenix/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub kpi: KpiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            agents: AgentsConfig::default(),
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            cost: CostConfig::default(),
            bus: BusConfig::default(),
            kpi: KpiConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `PHOENIX_CONFIG` if set, otherwise
    /// `~/.phoenix/config.toml`, falling back to defaults when neither
    /// exists.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::resolved_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check cross-field invariants that `serde` defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_retries must be at least 1".into(),
            ));
        }
        if self.auth.allow_registration && self.auth.jwt_secret.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.jwt_secret must be set when auth.allow_registration is true".into(),
            ));
        }
        Ok(())
    }

    fn resolved_path() -> PathBuf {
        if let Ok(p) = std::env::var("PHOENIX_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".phoenix")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// State Store tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            event_retention_days: default_event_retention_days(),
        }
    }
}

fn default_store_path() -> String {
    "~/.phoenix/phoenix.db".into()
}
fn default_event_retention_days() -> i64 {
    30
}

/// Task Queue tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_long_poll_wait_secs")]
    pub long_poll_max_wait_secs: u64,
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_task_threshold_secs: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reaper_period_secs")]
    pub reaper_period_secs: u64,
    #[serde(default = "default_task_retention_days")]
    pub task_retention_days: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            long_poll_max_wait_secs: default_long_poll_wait_secs(),
            stale_task_threshold_secs: default_stale_threshold_secs(),
            max_retries: default_max_retries(),
            reaper_period_secs: default_reaper_period_secs(),
            task_retention_days: default_task_retention_days(),
        }
    }
}

fn default_long_poll_wait_secs() -> u64 {
    30
}
fn default_stale_threshold_secs() -> i64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_reaper_period_secs() -> u64 {
    30
}
fn default_task_retention_days() -> i64 {
    7
}

/// Agent fleet tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_heartbeat_expiry_secs")]
    pub heartbeat_expiry_secs: i64,
    #[serde(default = "default_metrics_poll_interval_secs")]
    pub metrics_poll_interval_secs: u64,
    #[serde(default = "default_expiry_sweep_period_secs")]
    pub expiry_sweep_period_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            heartbeat_expiry_secs: default_heartbeat_expiry_secs(),
            metrics_poll_interval_secs: default_metrics_poll_interval_secs(),
            expiry_sweep_period_secs: default_expiry_sweep_period_secs(),
        }
    }
}

fn default_heartbeat_expiry_secs() -> i64 {
    90
}
fn default_metrics_poll_interval_secs() -> u64 {
    15
}
fn default_expiry_sweep_period_secs() -> u64 {
    30
}

/// HTTP gateway tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_ws_ping_secs")]
    pub ws_ping_interval_secs: u64,
    #[serde(default = "default_ws_read_deadline_secs")]
    pub ws_read_deadline_secs: u64,
    #[serde(default = "default_ws_write_deadline_secs")]
    pub ws_write_deadline_secs: u64,
    #[serde(default = "default_ws_max_message_bytes")]
    pub ws_max_message_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            allowed_origins: Vec::new(),
            ws_ping_interval_secs: default_ws_ping_secs(),
            ws_read_deadline_secs: default_ws_read_deadline_secs(),
            ws_write_deadline_secs: default_ws_write_deadline_secs(),
            ws_max_message_bytes: default_ws_max_message_bytes(),
        }
    }
}

fn default_gateway_port() -> u16 {
    8080
}
fn default_gateway_host() -> String {
    "0.0.0.0".into()
}
fn default_ws_ping_secs() -> u64 {
    54
}
fn default_ws_read_deadline_secs() -> u64 {
    60
}
fn default_ws_write_deadline_secs() -> u64 {
    10
}
fn default_ws_max_message_bytes() -> usize {
    512 * 1024
}

/// Token issuer tunables. The issuer itself is a black box;
/// these fields configure the concrete HS256 implementation this
/// repository ships so the gateway is runnable standalone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,
    #[serde(default = "default_access_ttl_secs")]
    pub access_token_ttl_secs: i64,
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_token_ttl_secs: i64,
    #[serde(default)]
    pub allow_registration: bool,
    #[serde(default = "default_blacklist_gc_period_secs")]
    pub blacklist_gc_period_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            jwt_issuer: default_jwt_issuer(),
            access_token_ttl_secs: default_access_ttl_secs(),
            refresh_token_ttl_secs: default_refresh_ttl_secs(),
            allow_registration: false,
            blacklist_gc_period_secs: default_blacklist_gc_period_secs(),
        }
    }
}

fn default_jwt_secret() -> String {
    String::new()
}
fn default_jwt_issuer() -> String {
    "phoenix-control-plane".into()
}
fn default_access_ttl_secs() -> i64 {
    900
}
fn default_refresh_ttl_secs() -> i64 {
    7 * 24 * 3600
}
fn default_blacklist_gc_period_secs() -> u64 {
    600
}

/// Cost-rate table used by the KPI Analyser's absolute cost model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    #[serde(default = "default_cost_per_million")]
    pub ingest_cost_per_million: f64,
    #[serde(default = "default_cost_per_gb")]
    pub storage_cost_per_gb: f64,
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: f64,
    #[serde(default = "default_processing_overhead_pct")]
    pub processing_overhead_pct: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            ingest_cost_per_million: default_cost_per_million(),
            storage_cost_per_gb: default_cost_per_gb(),
            retention_seconds: default_retention_seconds(),
            processing_overhead_pct: default_processing_overhead_pct(),
        }
    }
}

fn default_cost_per_million() -> f64 {
    0.25
}
fn default_cost_per_gb() -> f64 {
    0.023
}
fn default_retention_seconds() -> f64 {
    15.0 * 24.0 * 3600.0
}
fn default_processing_overhead_pct() -> f64 {
    20.0
}

/// Event Bus tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

fn default_subscriber_buffer() -> usize {
    256
}

/// Recommendation thresholds for the KPI Analyser and the
/// default critical-metric set used for the data-accuracy probe. An
/// experiment's metadata may override `critical_metrics` per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiConfig {
    #[serde(default = "default_min_cardinality_reduction_pct")]
    pub min_cardinality_reduction_pct: f64,
    #[serde(default = "default_min_cost_reduction_pct")]
    pub min_cost_reduction_pct: f64,
    #[serde(default = "default_min_accuracy_pct")]
    pub min_accuracy_pct: f64,
    #[serde(default = "default_max_cpu_increase_pct")]
    pub max_cpu_increase_pct: f64,
    #[serde(default = "default_strongly_recommend_cardinality_pct")]
    pub strongly_recommend_cardinality_pct: f64,
    #[serde(default = "default_strongly_recommend_accuracy_pct")]
    pub strongly_recommend_accuracy_pct: f64,
    #[serde(default = "default_critical_metrics")]
    pub critical_metrics: Vec<String>,
}

impl Default for KpiConfig {
    fn default() -> Self {
        Self {
            min_cardinality_reduction_pct: default_min_cardinality_reduction_pct(),
            min_cost_reduction_pct: default_min_cost_reduction_pct(),
            min_accuracy_pct: default_min_accuracy_pct(),
            max_cpu_increase_pct: default_max_cpu_increase_pct(),
            strongly_recommend_cardinality_pct: default_strongly_recommend_cardinality_pct(),
            strongly_recommend_accuracy_pct: default_strongly_recommend_accuracy_pct(),
            critical_metrics: default_critical_metrics(),
        }
    }
}

fn default_min_cardinality_reduction_pct() -> f64 {
    20.0
}
fn default_min_cost_reduction_pct() -> f64 {
    15.0
}
fn default_min_accuracy_pct() -> f64 {
    98.0
}
fn default_max_cpu_increase_pct() -> f64 {
    10.0
}
fn default_strongly_recommend_cardinality_pct() -> f64 {
    50.0
}
fn default_strongly_recommend_accuracy_pct() -> f64 {
    99.0
}
fn default_critical_metrics() -> Vec<String> {
    vec![
        "http_requests_total".to_string(),
        "http_request_duration_seconds".to_string(),
        "process_cpu_seconds_total".to_string(),
        "process_resident_memory_bytes".to_string(),
        "phoenix_control_plane_requests_total".to_string(),
        "phoenix_agent_health".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        let cfg = Config::default();
        assert_eq!(cfg.queue.long_poll_max_wait_secs, 30);
        assert_eq!(cfg.queue.stale_task_threshold_secs, 300);
        assert_eq!(cfg.queue.max_retries, 3);
        assert_eq!(cfg.agents.heartbeat_expiry_secs, 90);
        assert_eq!(cfg.bus.subscriber_buffer, 256);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.queue.max_retries, cfg.queue.max_retries);
    }

    #[test]
    fn registration_without_secret_is_invalid() {
        let mut cfg = Config::default();
        cfg.auth.allow_registration = true;
        assert!(cfg.validate().is_err());
    }
}
