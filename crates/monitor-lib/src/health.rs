//! Component health for liveness and readiness checks
//!
//! The monitor loop reports into a `HealthRegistry` after every tick; the
//! HTTP layer only reads from it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but the last tick hit errors for some targets
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_tick: Option<DateTime<Utc>>,
    /// Start of the most recent tick, whatever its outcome
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tick_started: Option<DateTime<Utc>>,
}

impl HealthResponse {
    /// Worst status across components; no components means healthy
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const SCHEDULER: &str = "scheduler";
    pub const TELEMETRY: &str = "telemetry";
    pub const RUN_STORE: &str = "run_store";
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
    last_completed_tick: Arc<RwLock<Option<DateTime<Utc>>>>,
    last_tick_started: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn record_tick_completed(&self, at: DateTime<Utc>) {
        *self.last_completed_tick.write().await = Some(at);
    }

    pub async fn record_tick_started(&self, at: DateTime<Utc>) {
        *self.last_tick_started.write().await = Some(at);
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse {
            status,
            components,
            last_completed_tick: *self.last_completed_tick.read().await,
            last_tick_started: *self.last_tick_started.read().await,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let not_ready = |reason: &str| ReadinessResponse {
            ready: false,
            reason: Some(reason.to_string()),
        };

        if !*self.ready.read().await {
            return not_ready("Monitor not yet initialized");
        }
        if self.health().await.status == ComponentStatus::Unhealthy {
            return not_ready("Critical component unhealthy");
        }
        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }

    /// Start of the last tick when it lies more than `max_tick_age` before `now`
    async fn stalled_since(&self, now: DateTime<Utc>, max_tick_age: Duration) -> Option<DateTime<Utc>> {
        let started = *self.last_tick_started.read().await;
        started.filter(|started| now - *started > max_tick_age)
    }

    /// Health with the scheduler forced unhealthy when the loop has not
    /// started a tick for longer than `max_tick_age`
    pub async fn health_at(&self, now: DateTime<Utc>, max_tick_age: Duration) -> HealthResponse {
        let mut health = self.health().await;
        if let Some(started) = self.stalled_since(now, max_tick_age).await {
            health.components.insert(
                components::SCHEDULER.to_string(),
                ComponentHealth::unhealthy(stall_message(started)),
            );
            health.status = ComponentStatus::Unhealthy;
        }
        health
    }

    /// Readiness that also fails when the loop has stalled. Skipped ticks
    /// count as started, so replicas waiting on the lock stay ready.
    pub async fn readiness_at(&self, now: DateTime<Utc>, max_tick_age: Duration) -> ReadinessResponse {
        let readiness = self.readiness().await;
        if !readiness.ready {
            return readiness;
        }

        match self.stalled_since(now, max_tick_age).await {
            Some(started) => ReadinessResponse {
                ready: false,
                reason: Some(stall_message(started)),
            },
            None => readiness,
        }
    }
}

fn stall_message(started: DateTime<Utc>) -> String {
    format!("Monitoring loop stalled, last tick started {}", started.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
        assert!(health.last_completed_tick.is_none());
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.register(components::SCHEDULER).await;
        registry.register(components::TELEMETRY).await;

        registry
            .set_degraded(components::TELEMETRY, "2 nodes without data")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::SCHEDULER, "lock service unreachable")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_requires_initialization() {
        let registry = HealthRegistry::new();
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_unhealthy_component_blocks_readiness() {
        let registry = HealthRegistry::new();
        registry.register(components::RUN_STORE).await;
        registry.set_ready(true).await;
        registry
            .set_unhealthy(components::RUN_STORE, "listing runs failed")
            .await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Critical component unhealthy")
        );
    }

    #[tokio::test]
    async fn test_stalled_loop_is_not_ready() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        let now = Utc::now();
        let max_age = Duration::minutes(3);

        assert!(registry.readiness_at(now, max_age).await.ready);

        registry
            .record_tick_started(now - Duration::minutes(2))
            .await;
        assert!(registry.readiness_at(now, max_age).await.ready);

        registry
            .record_tick_started(now - Duration::minutes(10))
            .await;
        let readiness = registry.readiness_at(now, max_age).await;
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().starts_with("Monitoring loop stalled"));

        let health = registry.health_at(now, max_age).await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(
            health.components[components::SCHEDULER].status,
            ComponentStatus::Unhealthy
        );
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_tick_completion_is_reported() {
        let registry = HealthRegistry::new();
        let now = Utc::now();
        registry.record_tick_completed(now).await;

        assert_eq!(registry.health().await.last_completed_tick, Some(now));
    }
}
