//! Health check and scrape endpoints
//!
//! `/healthz` and `/readyz` judge the monitoring loop by when it last started
//! a tick: a loop that misses `STALLED_TICKS` intervals in a row is treated
//! as hung. `/metrics` serves the default Prometheus registry.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use monitor_lib::health::{ComponentStatus, HealthRegistry};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Missed intervals after which the loop counts as stalled
const STALLED_TICKS: u32 = 3;

/// Lower bound so very short tick intervals do not flap the health checks
const MIN_STALL_AGE: Duration = Duration::from_secs(60);

const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    max_tick_age: chrono::Duration,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, tick_interval: Duration) -> Self {
        let stall_age = tick_interval
            .saturating_mul(STALLED_TICKS)
            .max(MIN_STALL_AGE);
        Self {
            health_registry,
            max_tick_age: chrono::Duration::from_std(stall_age)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    pub fn max_tick_age(&self) -> chrono::Duration {
        self.max_tick_age
    }
}

/// 200 while ticks keep running, even with degraded telemetry; 503 when a
/// component is unhealthy or the loop has stalled
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state
        .health_registry
        .health_at(Utc::now(), state.max_tick_age)
        .await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state
        .health_registry
        .readiness_at(Utc::now(), state.max_tick_age)
        .await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    ([("content-type", TEXT_CONTENT_TYPE)], buffer).into_response()
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Serving health checks and metrics");

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
