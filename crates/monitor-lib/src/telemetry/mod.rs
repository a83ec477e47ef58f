//! Telemetry retrieval
//!
//! Two interchangeable backends produce `UsageRecord`s for a node:
//! - `AgentTelemetryBackend` queries the per-node agent and rebuilds rates
//!   from cumulative counters
//! - `SeriesTelemetryBackend` queries a time-series store per metric family
//!   and merges the results by window
//!
//! Exactly one is active per deployment, selected by `create_backend`.

mod agent;
mod series;
mod store;

#[cfg(test)]
mod tests;

pub use agent::{parse_cpu_mask, AgentTelemetryBackend, AgentSample, AgentSpec};
pub use series::{
    adaptive_interval, clip_records, merge_records, SeriesSettings, SeriesTelemetryBackend,
};
pub use store::{
    BucketValue, DiskSample, HttpSeriesStore, MetricFamily, SeriesBucket, SeriesQuery,
    TimeSeriesStore,
};

use crate::error::TelemetryError;
use crate::models::UsageRecord;
use crate::platform::NodeRegistry;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;

pub use async_trait::async_trait;

/// Windows shorter than this carry too little data to derive rates from
pub const MIN_WINDOW_MILLIS: i64 = 1_000;

/// Trait for telemetry backend implementations
#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    /// Usage of `node` over `[from, to]`, ordered by window start.
    ///
    /// `interval` is a requested bucket width, not a guarantee.
    async fn fetch(
        &self,
        node: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: Option<Duration>,
    ) -> std::result::Result<Vec<UsageRecord>, TelemetryError>;

    /// Free disk space of a run container.
    ///
    /// Fails with `TelemetryError::Unavailable` when no disk data exists.
    async fn available_disk_bytes(
        &self,
        node: &str,
        pod_id: &str,
        image: &str,
    ) -> std::result::Result<u64, TelemetryError>;
}

/// Which backend a deployment uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Agent,
    Series,
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Port the per-node agent listens on
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Base URL of the time-series store
    #[serde(default = "default_series_url")]
    pub series_url: String,

    #[serde(default = "default_desired_bucket_count")]
    pub desired_bucket_count: u32,

    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,

    /// Look-back used when neither the store nor the node knows an oldest date
    #[serde(default = "default_fallback_window_hours")]
    pub fallback_window_hours: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_backend() -> BackendKind {
    BackendKind::Agent
}

fn default_agent_port() -> u16 {
    4194
}

fn default_series_url() -> String {
    "http://timeseries:9200".to_string()
}

fn default_desired_bucket_count() -> u32 {
    10
}

fn default_min_interval_secs() -> u64 {
    60
}

fn default_fallback_window_hours() -> u64 {
    24
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            agent_port: default_agent_port(),
            series_url: default_series_url(),
            desired_bucket_count: default_desired_bucket_count(),
            min_interval_secs: default_min_interval_secs(),
            fallback_window_hours: default_fallback_window_hours(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl TelemetryConfig {
    pub fn series_settings(&self) -> SeriesSettings {
        SeriesSettings {
            desired_bucket_count: self.desired_bucket_count,
            min_interval: Duration::seconds(self.min_interval_secs as i64),
            fallback_window: Duration::hours(self.fallback_window_hours as i64),
        }
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

/// Create the configured backend
pub fn create_backend(
    config: &TelemetryConfig,
    registry: Arc<dyn NodeRegistry>,
) -> Result<Arc<dyn TelemetryBackend>> {
    match config.backend {
        BackendKind::Agent => {
            tracing::info!(port = config.agent_port, "Using per-node agent telemetry backend");
            Ok(Arc::new(AgentTelemetryBackend::new(
                registry,
                config.agent_port,
                config.request_timeout(),
            )?))
        }
        BackendKind::Series => {
            tracing::info!(url = %config.series_url, "Using time-series telemetry backend");
            let store = HttpSeriesStore::new(&config.series_url, config.request_timeout())?;
            Ok(Arc::new(SeriesTelemetryBackend::new(
                Arc::new(store),
                registry,
                config.series_settings(),
            )))
        }
    }
}
