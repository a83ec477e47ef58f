//! Monitor library for run resource monitoring
//!
//! This crate provides the core functionality for:
//! - Telemetry retrieval from a per-node agent or a time-series store
//! - Idle detection with notify/pause/stop escalation
//! - Resource pressure tagging and alerts
//! - Platform API clients, notification delivery and lease locking
//! - Health checks and observability

pub mod error;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod platform;
pub mod policy;
pub mod telemetry;

pub use error::{MonitorError, TelemetryError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{MonitorLoop, ResourceMonitor, TickReport};
pub use observability::{MonitorLogger, MonitorMetrics};
pub use policy::{FilePolicyStore, PolicyResolver, PolicyStore, RemediationAction};
pub use telemetry::{create_backend, TelemetryBackend, TelemetryConfig};
