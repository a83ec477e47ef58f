//! Monitor configuration

use anyhow::Result;
use monitor_lib::TelemetryConfig;
use serde::Deserialize;

/// Monitor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Name reported in structured logs and used as the lock owner
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between monitoring ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_lock_lease")]
    pub lock_lease_secs: u64,

    /// Seconds between instance type feed polls
    #[serde(default = "default_instance_type_refresh")]
    pub instance_type_refresh_secs: u64,

    /// Platform API base URL
    #[serde(default = "default_platform_api_url")]
    pub platform_api_url: String,

    #[serde(default)]
    pub platform_api_token: Option<String>,

    /// Alertmanager-compatible webhook receiving notifications
    #[serde(default = "default_notification_webhook_url")]
    pub notification_webhook_url: String,

    /// TOML, JSON or YAML file holding monitoring preferences
    #[serde(default = "default_policy_file")]
    pub policy_file: String,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Keep the tick lock in process memory instead of the platform lock service
    #[serde(default)]
    pub use_local_lock: bool,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "run-monitor".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_tick_interval() -> u64 {
    60
}

fn default_lock_lease() -> u64 {
    600
}

fn default_instance_type_refresh() -> u64 {
    300
}

fn default_platform_api_url() -> String {
    "http://platform-api:8000/api/".to_string()
}

fn default_notification_webhook_url() -> String {
    "http://alertmanager:9093/api/v2/alerts".to_string()
}

fn default_policy_file() -> String {
    "/etc/run-monitor/preferences.toml".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

impl MonitorConfig {
    /// Load configuration from an optional file named by `MONITOR_CONFIG`
    /// and `MONITOR__*` environment variables, environment winning
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("MONITOR_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("MONITOR")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }

    pub fn lock_lease(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lock_lease_secs)
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs)
    }

    pub fn instance_type_refresh(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.instance_type_refresh_secs.max(1))
    }
}
