//! Contracts for the platform services the monitor depends on
//!
//! The monitor never owns run state, node metadata or notification delivery.
//! It talks to them through the traits below:
//! - `NodeRegistry` resolves node addresses, creation times and container ids
//! - `RunStore` lists runs, persists watermarks/tags and executes pause/stop
//! - `NotificationSink` accepts batched notifications
//! - `LeaseLock` provides the cross-process mutual exclusion for ticks

mod api;
mod memory;
mod webhook;

pub use api::{ApiClient, ApiLeaseLock, ApiNodeRegistry, ApiRunStore};
pub use memory::InMemoryLeaseLock;
pub use webhook::{AlertmanagerAlert, AlertmanagerPayload, WebhookNotifier};

use crate::models::{InstanceType, RunStatus, RunTag, Workload};
use crate::policy::PressureMetric;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use async_trait::async_trait;

/// Node metadata lookups
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Internal IP of the node, `None` if the node is not known (yet)
    async fn resolve_internal_address(&self, node_name: &str) -> Result<Option<String>>;

    async fn creation_timestamp(&self, node_name: &str) -> Result<Option<DateTime<Utc>>>;

    /// Container id of the run container inside a pod
    async fn container_id(&self, pod_id: &str, image: &str) -> Result<String>;
}

/// Read/write access to runs
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn list_running(&self) -> Result<Vec<Workload>>;

    async fn list_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<Workload>>;

    async fn persist_idle_watermarks(&self, batch: &[IdleWatermarkUpdate]) -> Result<()>;

    async fn persist_tags(&self, batch: &[TagChange]) -> Result<()>;

    async fn pause(&self, run_id: u64) -> Result<()>;

    async fn stop(&self, run_id: u64) -> Result<()>;
}

/// Batched notification delivery. Failures past the sink are its own concern.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_idle(&self, batch: &[IdleNotice], kind: NotificationKind) -> Result<()>;

    async fn notify_pressure(&self, batch: &[PressureNotice], kind: NotificationKind)
        -> Result<()>;

    async fn notify_stuck_transitions(&self, batch: &[Workload]) -> Result<()>;
}

/// Lease-based mutual exclusion shared by all monitor instances
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Try to take (or renew) the named lease. `false` means another holder owns it.
    async fn try_acquire(&self, name: &str, lease: Duration) -> Result<bool>;

    /// Whether this instance still owns an unexpired lease
    async fn is_held(&self, name: &str) -> Result<bool>;

    async fn release(&self, name: &str) -> Result<()>;
}

/// Source of instance type definitions
#[async_trait]
pub trait InstanceTypeFeed: Send + Sync {
    async fn instance_types(&self) -> Result<Vec<InstanceType>>;
}

/// New value of a run's idle watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleWatermarkUpdate {
    pub run_id: u64,
    pub last_idle_notification_time: Option<DateTime<Utc>>,
}

/// Add or remove one tag on a run. Other tags on the run are left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagChange {
    pub run_id: u64,
    pub tag: RunTag,
    pub present: bool,
}

impl TagChange {
    pub fn add(run_id: u64, tag: RunTag) -> Self {
        Self {
            run_id,
            tag,
            present: true,
        }
    }

    pub fn remove(run_id: u64, tag: RunTag) -> Self {
        Self {
            run_id,
            tag,
            present: false,
        }
    }
}

/// Notification categories understood by the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    IdleRun,
    IdleRunPaused,
    IdleRunStopped,
    HighConsumingResources,
    StuckInStatus,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NotificationKind::IdleRun => "idle_run",
            NotificationKind::IdleRunPaused => "idle_run_paused",
            NotificationKind::IdleRunStopped => "idle_run_stopped",
            NotificationKind::HighConsumingResources => "high_consuming_resources",
            NotificationKind::StuckInStatus => "stuck_in_status",
        };
        write!(f, "{}", name)
    }
}

/// One idle run in a notification batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleNotice {
    pub run_id: u64,
    pub owner: String,
    pub node_name: String,
    /// CPU load normalized by the instance vCPU count
    pub cpu_fraction: f64,
    pub idle_since: Option<DateTime<Utc>>,
}

/// One overloaded run in a notification batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureNotice {
    pub run_id: u64,
    pub owner: String,
    pub node_name: String,
    /// Metrics that crossed their threshold, with the observed fraction
    pub exceeded: BTreeMap<PressureMetric, f64>,
}
