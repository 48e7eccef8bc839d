// Configuration module

use serde::Deserialize;

/// One scan engine reachable over GMP/TLS.
#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_gmp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Seconds between engine polls per live scan.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Per-scan wall-clock cap in seconds.
    #[serde(default = "default_max_duration")]
    pub max_duration: u64,
    /// Delete engine target/task after the report is fetched.
    #[serde(default)]
    pub cleanup_after_report: bool,
    /// Anti-starvation threshold for the probe selector.
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive_same_probe: usize,
    /// Engine scan configuration name, passed through on task creation.
    #[serde(default = "default_scan_config")]
    pub gvm_scan_config: String,
    /// Engine scanner name, passed through on task creation.
    #[serde(default = "default_scanner")]
    pub gvm_scanner: String,
    /// Port range sent for full scans.
    #[serde(default = "default_port_list")]
    pub default_port_list: String,
    /// Store file path.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Engine operation retries before giving up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Fixed backoff between engine retries, seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Consecutive failed polls tolerated before a scan is failed.
    #[serde(default = "default_poll_failure_budget")]
    pub poll_failure_budget: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_duration: default_max_duration(),
            cleanup_after_report: false,
            max_consecutive_same_probe: default_max_consecutive(),
            gvm_scan_config: default_scan_config(),
            gvm_scanner: default_scanner(),
            default_port_list: default_port_list(),
            db_path: default_db_path(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            poll_failure_budget: default_poll_failure_budget(),
        }
    }
}

/// Upstream inventory coupling. Absent section disables both Target Sync
/// and the Scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Seconds between inventory pulls.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Outbound HTTP timeout, seconds.
    #[serde(default = "default_source_timeout")]
    pub timeout: u64,
    /// Seconds between due-scan ticks.
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load from the YAML file named by `GVM_FLEET_CONFIG` (default
    /// `config.yaml`, optional) with `GVM_FLEET__SECTION__KEY` environment
    /// overrides on top.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path =
            std::env::var("GVM_FLEET_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("GVM_FLEET").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

fn default_gmp_port() -> u16 {
    9390
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_duration() -> u64 {
    4 * 3600
}

fn default_max_consecutive() -> usize {
    3
}

fn default_scan_config() -> String {
    "Full and fast".to_string()
}

fn default_scanner() -> String {
    "OpenVAS Default".to_string()
}

fn default_port_list() -> String {
    "1-65535".to_string()
}

fn default_db_path() -> String {
    "gvm_fleet.db".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_poll_failure_budget() -> u32 {
    5
}

fn default_sync_interval() -> u64 {
    300
}

fn default_source_timeout() -> u64 {
    30
}

fn default_scheduler_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}
