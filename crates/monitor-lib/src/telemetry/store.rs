//! Time-series store access
//!
//! The store answers one query per metric family and returns timestamped
//! buckets. `HttpSeriesStore` is the JSON-over-HTTP client used in
//! deployments; tests plug in their own `TimeSeriesStore`.

use crate::error::TelemetryError;
use crate::models::{GpuUsage, NetworkUsage};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Metric families queried separately from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFamily {
    Cpu,
    Memory,
    Filesystem,
    Network,
    Gpu,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 5] = [
        MetricFamily::Cpu,
        MetricFamily::Memory,
        MetricFamily::Filesystem,
        MetricFamily::Network,
        MetricFamily::Gpu,
    ];
}

/// Query for one family over `[start, end]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesQuery {
    pub family: MetricFamily,
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval_ms: i64,
}

/// Raw filesystem gauge as stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSample {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

/// Family-specific value of one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketValue {
    Cpu { load: f64 },
    Memory { capacity_bytes: u64, used_bytes: u64 },
    Filesystem { disks: HashMap<String, DiskSample> },
    Network { interfaces: HashMap<String, NetworkUsage> },
    Gpu(GpuUsage),
}

/// One aggregation bucket starting at `timestamp`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesBucket {
    pub timestamp: DateTime<Utc>,
    pub value: BucketValue,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    buckets: Vec<SeriesBucket>,
}

#[derive(Debug, Deserialize)]
struct OldestResponse {
    oldest: Option<DateTime<Utc>>,
}

/// Trait for time-series store implementations
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn query(&self, query: &SeriesQuery) -> Result<Vec<SeriesBucket>, TelemetryError>;

    /// Start of the oldest index still retained, if known
    async fn oldest_available(&self) -> Result<Option<DateTime<Utc>>, TelemetryError>;
}

/// HTTP client for the time-series store
pub struct HttpSeriesStore {
    client: Client,
    base_url: Url,
}

impl HttpSeriesStore {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: Url::parse(base_url).context("Invalid time-series store URL")?,
        })
    }

    fn url(&self, path: &str) -> Result<Url, TelemetryError> {
        self.base_url
            .join(path)
            .map_err(|e| TelemetryError::transport(self.base_url.as_str(), e))
    }

    async fn read<T: DeserializeOwned>(
        target: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TelemetryError> {
        let response = request
            .send()
            .await
            .map_err(|e| TelemetryError::transport(target, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::transport(
                target,
                format!("store returned {}: {}", status, body),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| TelemetryError::decode(target, e))
    }
}

#[async_trait]
impl TimeSeriesStore for HttpSeriesStore {
    async fn query(&self, query: &SeriesQuery) -> Result<Vec<SeriesBucket>, TelemetryError> {
        let url = self.url("api/v1/series/query")?;
        let response: QueryResponse =
            Self::read(&query.node, self.client.post(url).json(query)).await?;
        Ok(response.buckets)
    }

    async fn oldest_available(&self) -> Result<Option<DateTime<Utc>>, TelemetryError> {
        let url = self.url("api/v1/series/oldest")?;
        let response: OldestResponse = Self::read("series-store", self.client.get(url)).await?;
        Ok(response.oldest)
    }
}
