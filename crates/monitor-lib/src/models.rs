//! Core data models for the resource monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Memory gauge for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

/// Filesystem gauge for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub capacity_bytes: u64,
    /// Free space available on the device
    pub usable_bytes: u64,
}

/// Network throughput for one interface
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkUsage {
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
}

/// GPU usage as reported by the time-series store
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuUsage {
    pub device_count: u32,
    /// Mean utilization across devices (0.0 - 1.0)
    pub utilization: f64,
    pub memory_used_bytes: u64,
}

/// Static allocation a record was sampled against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub max_memory_bytes: u64,
    pub core_count: u32,
}

/// Utilization of one node or workload over one time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub window_millis: i64,
    /// Fractional load, 1.0 = one full core saturated
    pub cpu: Option<f64>,
    pub memory: Option<MemoryUsage>,
    pub disks: Option<HashMap<String, DiskUsage>>,
    pub network: Option<HashMap<String, NetworkUsage>>,
    pub gpu: Option<GpuUsage>,
    pub container_spec: Option<ContainerSpec>,
}

impl UsageRecord {
    /// Create an empty record for `[start, end]`.
    ///
    /// Returns `None` when the window has no positive duration.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        if end <= start {
            return None;
        }
        Some(Self {
            window_start: start,
            window_end: end,
            window_millis: (end - start).num_milliseconds(),
            cpu: None,
            memory: None,
            disks: None,
            network: None,
            gpu: None,
            container_spec: None,
        })
    }

    /// Rewrite the window, keeping `window_millis` consistent
    pub fn with_window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        if end <= start {
            return None;
        }
        self.window_start = start;
        self.window_end = end;
        self.window_millis = (end - start).num_milliseconds();
        Some(self)
    }

    /// True iff every sub-metric is present
    pub fn is_complete(&self) -> bool {
        self.cpu.is_some()
            && self.memory.is_some()
            && self.disks.is_some()
            && self.network.is_some()
            && self.gpu.is_some()
    }

    /// Memory used over capacity
    pub fn memory_fraction(&self) -> Option<f64> {
        let memory = self.memory?;
        if memory.capacity_bytes == 0 {
            return None;
        }
        Some(memory.used_bytes as f64 / memory.capacity_bytes as f64)
    }

    /// Used space over capacity, summed across all devices
    pub fn filesystem_fraction(&self) -> Option<f64> {
        let disks = self.disks.as_ref().filter(|d| !d.is_empty())?;
        let capacity: u64 = disks.values().map(|d| d.capacity_bytes).sum();
        if capacity == 0 {
            return None;
        }
        let used: u64 = disks
            .values()
            .map(|d| d.capacity_bytes.saturating_sub(d.usable_bytes))
            .sum();
        Some(used as f64 / capacity as f64)
    }
}

/// Monitoring markers carried on a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunTag {
    Idle,
    Pressure,
}

impl std::fmt::Display for RunTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunTag::Idle => write!(f, "IDLE"),
            RunTag::Pressure => write!(f, "PRESSURE"),
        }
    }
}

/// Run status as reported by the run store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopped,
    Failure,
    Success,
}

/// A running workload together with the monitoring state the run store keeps for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub run_id: u64,
    pub owner: String,
    pub status: RunStatus,
    pub node_name: Option<String>,
    pub instance_type: Option<String>,
    pub pod_id: Option<String>,
    pub docker_image: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Last time the user extended the run; exempts it from idle checks
    pub prolonged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_spot: bool,
    #[serde(default)]
    pub non_pausable: bool,
    #[serde(default)]
    pub cluster_member: bool,
    pub last_idle_notification_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeSet<RunTag>,
    /// Runs this one was restarted from, oldest first
    #[serde(default)]
    pub restart_lineage: Vec<u64>,
}

impl Workload {
    pub fn has_tag(&self, tag: RunTag) -> bool {
        self.tags.contains(&tag)
    }

    /// Whether pause/stop must never be executed for this run
    pub fn is_action_protected(&self) -> bool {
        self.non_pausable || self.cluster_member
    }
}

/// Instance type entry from the upstream catalog feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub vcpus: u32,
}
