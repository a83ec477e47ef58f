//! Run Monitor - resource monitoring and idle remediation for cluster runs
//!
//! This binary runs one monitoring loop per replica. Ticks are serialized
//! across replicas by a lease lock, so several replicas may be deployed.

use anyhow::Result;
use monitor_lib::{
    create_backend,
    health::{components, HealthRegistry},
    observability::{MonitorLogger, MonitorMetrics},
    platform::{
        ApiClient, ApiLeaseLock, ApiNodeRegistry, ApiRunStore, InMemoryLeaseLock,
        InstanceTypeFeed, LeaseLock, NodeRegistry, WebhookNotifier,
    },
    FilePolicyStore, InstanceType, MonitorLoop, PolicyResolver, ResourceMonitor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const MONITOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grace period for an in-flight tick after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting run-monitor");

    // Load configuration
    let config = config::MonitorConfig::load()?;
    info!(
        instance = %config.instance,
        tick_interval_secs = config.tick_interval_secs,
        "Monitor configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::TELEMETRY).await;
    health_registry.register(components::RUN_STORE).await;

    // Register metric families before the first scrape
    MonitorMetrics::new();
    let logger = MonitorLogger::new(&config.instance);
    logger.log_startup(
        MONITOR_VERSION,
        &format!("{:?}", config.telemetry.backend).to_lowercase(),
    );

    // Platform collaborators
    let client = Arc::new(ApiClient::new(
        &config.platform_api_url,
        config.platform_api_token.clone(),
        config.http_timeout(),
    )?);
    let registry: Arc<dyn NodeRegistry> = Arc::new(ApiNodeRegistry::new(client.clone()));
    let telemetry = create_backend(&config.telemetry, registry)?;
    let notifier = WebhookNotifier::new(&config.notification_webhook_url, config.http_timeout())?;
    let lock: Arc<dyn LeaseLock> = if config.use_local_lock {
        warn!("Using in-process tick lock, run a single replica only");
        Arc::new(InMemoryLeaseLock::new(&config.instance))
    } else {
        Arc::new(ApiLeaseLock::new(client.clone(), &config.instance))
    };

    // Policy is re-read every tick; this only surfaces a broken file early
    let policy = PolicyResolver::new(Arc::new(FilePolicyStore::new(&config.policy_file)));
    match policy.threshold_set().await {
        Ok(thresholds) => info!(
            idle_cpu_fraction = thresholds.idle_cpu_fraction,
            idle_action = %thresholds.remediation_action,
            idle_action_timeout_minutes = thresholds.idle_action_timeout_minutes,
            "Monitoring policy loaded"
        ),
        Err(e) => warn!(
            error = %e,
            policy_file = %config.policy_file,
            "Monitoring policy incomplete, affected phases are skipped until it is fixed"
        ),
    }

    let monitor = ResourceMonitor::builder()
        .telemetry(telemetry)
        .run_store(Arc::new(ApiRunStore::new(client.clone())))
        .notifications(Arc::new(notifier))
        .lock(lock)
        .policy(policy)
        .lease(config.lock_lease())
        .instance(&config.instance)
        .build()?;
    let monitor = Arc::new(monitor);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Instance type feed
    let (types_tx, types_rx) = mpsc::channel(4);
    let feed_handle = tokio::spawn(poll_instance_types(
        client.clone(),
        types_tx,
        config.instance_type_refresh(),
        shutdown_tx.subscribe(),
    ));

    // Monitoring loop
    let monitor_loop = MonitorLoop::new(monitor, config.tick_interval())
        .with_health(health_registry.clone())
        .with_instance_type_updates(types_rx);
    let loop_handle = tokio::spawn(monitor_loop.run(shutdown_tx.subscribe()));

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        config.tick_interval(),
    ));
    debug!(
        stall_after_secs = app_state.max_tick_age().num_seconds(),
        "Health check stall threshold"
    );

    health_registry.set_ready(true).await;

    // Start health and metrics server
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    if tokio::time::timeout(SHUTDOWN_GRACE, loop_handle).await.is_err() {
        warn!("Monitoring loop did not stop within the grace period");
    }
    feed_handle.abort();
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}

/// Poll the instance type feed and forward each snapshot to the loop
async fn poll_instance_types(
    feed: Arc<dyn InstanceTypeFeed>,
    updates: mpsc::Sender<Vec<InstanceType>>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match feed.instance_types().await {
                    Ok(types) => {
                        debug!(count = types.len(), "Fetched instance types");
                        if updates.send(types).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to fetch instance types"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
