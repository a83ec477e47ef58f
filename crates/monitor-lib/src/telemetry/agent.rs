//! Per-node agent telemetry backend
//!
//! The agent exposes cumulative counters (cAdvisor-compatible JSON):
//! - `GET /api/v1.3/containers/` for the node root container
//! - `GET /api/v1.3/docker/{id}` for a single container
//!
//! Rates are rebuilt from consecutive sample pairs; gauges are read from the
//! earlier sample of each pair.

use super::{TelemetryBackend, MIN_WINDOW_MILLIS};
use crate::error::TelemetryError;
use crate::models::{ContainerSpec, DiskUsage, MemoryUsage, NetworkUsage, UsageRecord};
use crate::platform::NodeRegistry;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const ROOT_CONTAINER_PATH: &str = "/api/v1.3/containers/";
const DOCKER_CONTAINER_PATH: &str = "/api/v1.3/docker/";

const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// Static description of what the agent collects on a node
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentSpec {
    #[serde(default)]
    pub has_cpu: bool,
    #[serde(default)]
    pub has_memory: bool,
    #[serde(default)]
    pub has_filesystem: bool,
    #[serde(default)]
    pub has_network: bool,
    #[serde(default)]
    pub cpu: Option<AgentCpuSpec>,
    #[serde(default)]
    pub memory: Option<AgentMemorySpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentCpuSpec {
    /// cpuset mask, e.g. "0-3,6"
    #[serde(default)]
    pub mask: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentMemorySpec {
    #[serde(default)]
    pub limit: u64,
}

/// One cumulative sample
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSample {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cpu: Option<AgentCpuStats>,
    #[serde(default)]
    pub memory: Option<AgentMemoryStats>,
    #[serde(default)]
    pub filesystem: Vec<AgentFilesystemStats>,
    #[serde(default)]
    pub network: Option<AgentNetworkStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentCpuStats {
    pub usage: AgentCpuUsage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentCpuUsage {
    /// Total CPU time consumed, nanoseconds
    pub total: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentMemoryStats {
    pub usage: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentFilesystemStats {
    pub device: String,
    pub capacity: u64,
    pub usage: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentNetworkStats {
    #[serde(default)]
    pub interfaces: Vec<AgentInterfaceStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentInterfaceStats {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Agent response for one container
#[derive(Debug, Clone, Deserialize)]
struct AgentContainerInfo {
    #[serde(default)]
    spec: AgentSpec,
    #[serde(default)]
    stats: Vec<AgentSample>,
}

/// Count the CPUs in a cpuset mask such as "0-3,6"
pub fn parse_cpu_mask(mask: &str) -> u32 {
    mask.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('-') {
            Some((lo, hi)) => match (lo.parse::<u32>(), hi.parse::<u32>()) {
                (Ok(lo), Ok(hi)) if hi >= lo => hi - lo + 1,
                _ => 0,
            },
            None => u32::from(part.parse::<u32>().is_ok()),
        })
        .sum()
}

/// Telemetry backend talking to the agent on each node
pub struct AgentTelemetryBackend {
    client: Client,
    registry: Arc<dyn NodeRegistry>,
    port: u16,
}

impl AgentTelemetryBackend {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        port: u16,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            registry,
            port,
        })
    }

    async fn resolve_address(&self, node: &str) -> Result<Option<String>, TelemetryError> {
        self.registry
            .resolve_internal_address(node)
            .await
            .map_err(|e| TelemetryError::unavailable(node, format!("node lookup failed: {}", e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, target: &str, url: &str) -> Result<T, TelemetryError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TelemetryError::transport(target, e))?;

        if !response.status().is_success() {
            return Err(TelemetryError::transport(
                target,
                format!("agent returned {}", response.status()),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| TelemetryError::decode(target, e))
    }

    /// Combine consecutive cumulative samples into usage records
    pub fn build_records(
        target: &str,
        spec: &AgentSpec,
        mut samples: Vec<AgentSample>,
    ) -> Result<Vec<UsageRecord>, TelemetryError> {
        samples.sort_by_key(|s| s.timestamp);

        let container_spec = spec.memory.as_ref().map(|memory| ContainerSpec {
            max_memory_bytes: memory.limit,
            core_count: spec
                .cpu
                .as_ref()
                .map(|cpu| parse_cpu_mask(&cpu.mask))
                .unwrap_or(0),
        });

        let mut records = Vec::with_capacity(samples.len().saturating_sub(1));
        for pair in samples.windows(2) {
            if let Some(mut record) = Self::build_record(target, spec, &pair[0], &pair[1])? {
                record.container_spec = container_spec;
                records.push(record);
            }
        }
        Ok(records)
    }

    fn build_record(
        target: &str,
        spec: &AgentSpec,
        prev: &AgentSample,
        next: &AgentSample,
    ) -> Result<Option<UsageRecord>, TelemetryError> {
        let mut record = match UsageRecord::new(prev.timestamp, next.timestamp) {
            Some(r) if r.window_millis >= MIN_WINDOW_MILLIS => r,
            _ => {
                debug!(target = %target, "Skipping sample pair with sub-second window");
                return Ok(None);
            }
        };
        let window_millis = record.window_millis as f64;
        let window_secs = window_millis / 1000.0;

        if spec.has_cpu {
            if let (Some(p), Some(n)) = (&prev.cpu, &next.cpu) {
                match n.usage.total.checked_sub(p.usage.total) {
                    Some(consumed) => {
                        record.cpu = Some(consumed as f64 / (window_millis * NANOS_PER_MILLI));
                    }
                    None => debug!(target = %target, "CPU counter reset, no load for this window"),
                }
            }
        }

        if spec.has_memory {
            if let Some(memory) = &prev.memory {
                record.memory = Some(MemoryUsage {
                    capacity_bytes: spec.memory.as_ref().map(|m| m.limit).unwrap_or(0),
                    used_bytes: memory.usage,
                });
            }
        }

        if spec.has_filesystem {
            let disks = prev
                .filesystem
                .iter()
                .map(|fs| {
                    (
                        fs.device.clone(),
                        DiskUsage {
                            capacity_bytes: fs.capacity,
                            usable_bytes: fs.capacity.saturating_sub(fs.usage),
                        },
                    )
                })
                .collect();
            record.disks = Some(disks);
        }

        if spec.has_network {
            let empty = AgentNetworkStats::default();
            let prev_net = prev.network.as_ref().unwrap_or(&empty);
            let next_net = next.network.as_ref().unwrap_or(&empty);

            let mut network = HashMap::with_capacity(prev_net.interfaces.len());
            for iface in &prev_net.interfaces {
                let later = next_net
                    .interfaces
                    .iter()
                    .find(|i| i.name == iface.name)
                    .ok_or_else(|| {
                        TelemetryError::inconsistent(
                            target,
                            format!("interface {} missing from later sample", iface.name),
                        )
                    })?;

                let (Some(rx), Some(tx)) = (
                    later.rx_bytes.checked_sub(iface.rx_bytes),
                    later.tx_bytes.checked_sub(iface.tx_bytes),
                ) else {
                    debug!(target = %target, interface = %iface.name, "Network counter reset, skipping interface");
                    continue;
                };

                network.insert(
                    iface.name.clone(),
                    NetworkUsage {
                        rx_bytes_per_sec: rx as f64 / window_secs,
                        tx_bytes_per_sec: tx as f64 / window_secs,
                    },
                );
            }
            record.network = Some(network);
        }

        Ok(Some(record))
    }
}

#[async_trait]
impl TelemetryBackend for AgentTelemetryBackend {
    async fn fetch(
        &self,
        node: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        _interval: Option<Duration>,
    ) -> Result<Vec<UsageRecord>, TelemetryError> {
        let address = match self.resolve_address(node).await? {
            Some(address) => address,
            None => {
                debug!(node = %node, "Node has no internal address yet");
                return Ok(Vec::new());
            }
        };

        let url = format!("http://{}:{}{}", address, self.port, ROOT_CONTAINER_PATH);
        let info: AgentContainerInfo = self.get_json(node, &url).await?;

        let records = Self::build_records(node, &info.spec, info.stats)?;
        Ok(records
            .into_iter()
            .filter(|r| r.window_end > from && r.window_start < to)
            .collect())
    }

    async fn available_disk_bytes(
        &self,
        node: &str,
        pod_id: &str,
        image: &str,
    ) -> Result<u64, TelemetryError> {
        let address = self
            .resolve_address(node)
            .await?
            .ok_or_else(|| TelemetryError::unavailable(node, "node has no internal address"))?;

        let container_id = self
            .registry
            .container_id(pod_id, image)
            .await
            .map_err(|e| TelemetryError::unavailable(pod_id, format!("container lookup failed: {}", e)))?;

        let url = format!(
            "http://{}:{}{}{}",
            address, self.port, DOCKER_CONTAINER_PATH, container_id
        );
        let containers: HashMap<String, AgentContainerInfo> =
            self.get_json(&container_id, &url).await?;

        let info = containers
            .into_values()
            .next()
            .ok_or_else(|| TelemetryError::unavailable(&container_id, "agent returned no container"))?;

        let records = Self::build_records(&container_id, &info.spec, info.stats)?;
        records
            .last()
            .and_then(|r| r.disks.as_ref())
            .filter(|disks| !disks.is_empty())
            .map(|disks| disks.values().map(|d| d.usable_bytes).sum())
            .ok_or_else(|| TelemetryError::unavailable(&container_id, "no filesystem data"))
    }
}
