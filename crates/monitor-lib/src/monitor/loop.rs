//! Fixed-interval schedule driving monitoring ticks
//!
//! Ticks never overlap inside one process: a tick runs to completion before
//! the next timer event is taken, and missed events are skipped rather than
//! replayed. Instance type feed emissions are applied between ticks.

use super::orchestrator::{ResourceMonitor, TickReport};
use crate::error::MonitorError;
use crate::health::{components, HealthRegistry};
use crate::models::InstanceType;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct MonitorLoop {
    monitor: Arc<ResourceMonitor>,
    health: HealthRegistry,
    interval: Duration,
    instance_types: Option<mpsc::Receiver<Vec<InstanceType>>>,
}

impl MonitorLoop {
    pub fn new(monitor: Arc<ResourceMonitor>, interval: Duration) -> Self {
        Self {
            monitor,
            health: HealthRegistry::new(),
            interval,
            instance_types: None,
        }
    }

    /// Report tick outcomes into `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    /// Apply instance type snapshots received on `updates`
    pub fn with_instance_type_updates(mut self, updates: mpsc::Receiver<Vec<InstanceType>>) -> Self {
        self.instance_types = Some(updates);
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let MonitorLoop {
            monitor,
            health,
            interval: period,
            mut instance_types,
        } = self;

        info!(interval_secs = period.as_secs(), "Starting monitoring loop");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_tick(&monitor, &health).await;
                }
                Some(types) = next_update(&mut instance_types) => {
                    debug!(count = types.len(), "Received instance type snapshot");
                    monitor.update_instance_types(types);
                }
                _ = shutdown.recv() => {
                    info!("Shutting down monitoring loop");
                    break;
                }
            }
        }
    }
}

async fn next_update(
    updates: &mut Option<mpsc::Receiver<Vec<InstanceType>>>,
) -> Option<Vec<InstanceType>> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Run one tick and fold its outcome into the health registry
pub(crate) async fn run_tick(monitor: &ResourceMonitor, health: &HealthRegistry) -> Option<TickReport> {
    health.record_tick_started(Utc::now()).await;
    match monitor.tick().await {
        Ok(report) => {
            health.set_healthy(components::RUN_STORE).await;
            if report.failed_phases.is_empty() {
                health.set_healthy(components::SCHEDULER).await;
            } else {
                health
                    .set_degraded(
                        components::SCHEDULER,
                        format!("failed phases: {}", report.failed_phases.join(",")),
                    )
                    .await;
            }

            if !report.skipped {
                if report.node_errors > 0 {
                    health
                        .set_degraded(
                            components::TELEMETRY,
                            format!("{} nodes without telemetry", report.node_errors),
                        )
                        .await;
                } else {
                    health.set_healthy(components::TELEMETRY).await;
                }
                health.record_tick_completed(Utc::now()).await;
            }
            Some(report)
        }
        Err(MonitorError::Store(reason)) => {
            warn!(error = %reason, "Monitoring tick aborted, run store unavailable");
            health.set_unhealthy(components::RUN_STORE, reason).await;
            None
        }
        Err(e) => {
            warn!(error = %e, "Monitoring tick aborted");
            health.set_degraded(components::SCHEDULER, e.to_string()).await;
            None
        }
    }
}
