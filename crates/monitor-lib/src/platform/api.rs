//! REST adapters for the platform API
//!
//! Runs, nodes, locks and the instance type catalog are served by the
//! platform API. All calls share one `reqwest` client with a bounded timeout.

use super::{
    IdleWatermarkUpdate, InstanceTypeFeed, LeaseLock, NodeRegistry, RunStore, TagChange,
};
use crate::models::{InstanceType, RunStatus, Workload};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// API client for the platform REST API
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("Invalid path")
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        self.get_optional(path, query)
            .await?
            .ok_or_else(|| anyhow::anyhow!("API error (404 Not Found): {}", path))
    }

    /// Make a GET request, mapping 404 to `None`
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let url = self.url(path)?;

        let response = self
            .authorize(self.client.get(url).query(query))
            .send()
            .await
            .context("Failed to send request")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response
            .json()
            .await
            .map(Some)
            .context("Failed to parse response")
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.send_post(path, body).await?;
        response.json().await.context("Failed to parse response")
    }

    /// Make a POST request whose response body is ignored
    pub async fn post_no_content<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        self.send_post(path, body).await.map(|_| ())
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str, query: &[(&str, &str)]) -> Result<()> {
        let url = self.url(path)?;

        let response = self
            .authorize(self.client.delete(url).query(query))
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        Ok(())
    }

    async fn send_post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = self.url(path)?;

        let response = self
            .authorize(self.client.post(url).json(body))
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        Ok(response)
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRef {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub owner: String,
    pub lease_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub acquired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseStatus {
    pub held: bool,
}

fn status_name(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Pausing => "PAUSING",
        RunStatus::Paused => "PAUSED",
        RunStatus::Resuming => "RESUMING",
        RunStatus::Stopped => "STOPPED",
        RunStatus::Failure => "FAILURE",
        RunStatus::Success => "SUCCESS",
    }
}

/// Run store backed by the platform API
pub struct ApiRunStore {
    client: Arc<ApiClient>,
}

impl ApiRunStore {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RunStore for ApiRunStore {
    async fn list_running(&self) -> Result<Vec<Workload>> {
        self.list_by_status(&[RunStatus::Running]).await
    }

    async fn list_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<Workload>> {
        let query: Vec<(&str, &str)> = statuses
            .iter()
            .map(|s| ("status", status_name(*s)))
            .collect();
        self.client.get("runs", &query).await
    }

    async fn persist_idle_watermarks(&self, batch: &[IdleWatermarkUpdate]) -> Result<()> {
        self.client
            .post_no_content("runs/idle-notifications", batch)
            .await
    }

    async fn persist_tags(&self, batch: &[TagChange]) -> Result<()> {
        self.client.post_no_content("runs/tags", batch).await
    }

    async fn pause(&self, run_id: u64) -> Result<()> {
        self.client
            .post_no_content(&format!("runs/{}/pause", run_id), &serde_json::json!({}))
            .await
    }

    async fn stop(&self, run_id: u64) -> Result<()> {
        self.client
            .post_no_content(&format!("runs/{}/stop", run_id), &serde_json::json!({}))
            .await
    }
}

/// Node registry backed by the platform API
pub struct ApiNodeRegistry {
    client: Arc<ApiClient>,
}

impl ApiNodeRegistry {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }

    async fn node(&self, node_name: &str) -> Result<Option<NodeInfo>> {
        self.client
            .get_optional(&format!("nodes/{}", node_name), &[])
            .await
    }
}

#[async_trait]
impl NodeRegistry for ApiNodeRegistry {
    async fn resolve_internal_address(&self, node_name: &str) -> Result<Option<String>> {
        Ok(self.node(node_name).await?.and_then(|n| n.internal_ip))
    }

    async fn creation_timestamp(&self, node_name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.node(node_name).await?.and_then(|n| n.created_at))
    }

    async fn container_id(&self, pod_id: &str, image: &str) -> Result<String> {
        let container: ContainerRef = self
            .client
            .get(&format!("pods/{}/container", pod_id), &[("image", image)])
            .await?;
        Ok(container.container_id)
    }
}

#[async_trait]
impl InstanceTypeFeed for ApiClient {
    async fn instance_types(&self) -> Result<Vec<InstanceType>> {
        self.get("cluster/instance-types", &[]).await
    }
}

/// Lease lock backed by the platform lock service
pub struct ApiLeaseLock {
    client: Arc<ApiClient>,
    owner: String,
}

impl ApiLeaseLock {
    pub fn new(client: Arc<ApiClient>, owner: impl Into<String>) -> Self {
        Self {
            client,
            owner: owner.into(),
        }
    }
}

#[async_trait]
impl LeaseLock for ApiLeaseLock {
    async fn try_acquire(&self, name: &str, lease: Duration) -> Result<bool> {
        let request = LeaseRequest {
            owner: self.owner.clone(),
            lease_secs: lease.as_secs(),
        };
        let response: LeaseResponse = self
            .client
            .post(&format!("locks/{}", name), &request)
            .await?;
        Ok(response.acquired)
    }

    async fn is_held(&self, name: &str) -> Result<bool> {
        let status: Option<LeaseStatus> = self
            .client
            .get_optional(&format!("locks/{}", name), &[("owner", self.owner.as_str())])
            .await?;
        Ok(status.map(|s| s.held).unwrap_or(false))
    }

    async fn release(&self, name: &str) -> Result<()> {
        self.client
            .delete(&format!("locks/{}", name), &[("owner", self.owner.as_str())])
            .await
    }
}
