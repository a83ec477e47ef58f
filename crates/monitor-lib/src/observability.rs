//! Observability infrastructure for the resource monitor
//!
//! Provides:
//! - Prometheus metrics (tick latency, tick outcomes, idle/pressure gauges, remediation counters)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Histogram, IntCounterVec,
    IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Tick latency buckets in seconds. Ticks are dominated by telemetry round trips.
const TICK_LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

static GLOBAL_METRICS: OnceLock<MonitorMetricsInner> = OnceLock::new();

struct MonitorMetricsInner {
    tick_latency_seconds: Histogram,
    ticks_total: IntCounterVec,
    idle_workloads: IntGauge,
    pressured_workloads: IntGauge,
    remediation_actions_total: IntCounterVec,
    notifications_total: IntCounterVec,
    telemetry_errors_total: IntCounterVec,
    instance_types_known: IntGauge,
}

impl MonitorMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "run_monitor_tick_latency_seconds",
                "Wall time of one monitoring tick",
                TICK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            ticks_total: register_int_counter_vec!(
                "run_monitor_ticks_total",
                "Monitoring ticks by outcome",
                &["outcome"]
            )
            .expect("Failed to register ticks_total"),

            idle_workloads: register_int_gauge!(
                "run_monitor_idle_workloads",
                "Runs carrying the IDLE tag after the last tick"
            )
            .expect("Failed to register idle_workloads"),

            pressured_workloads: register_int_gauge!(
                "run_monitor_pressured_workloads",
                "Runs carrying the PRESSURE tag after the last tick"
            )
            .expect("Failed to register pressured_workloads"),

            remediation_actions_total: register_int_counter_vec!(
                "run_monitor_remediation_actions_total",
                "Pause and stop calls issued for idle runs",
                &["action"]
            )
            .expect("Failed to register remediation_actions_total"),

            notifications_total: register_int_counter_vec!(
                "run_monitor_notifications_total",
                "Notification entries handed to the sink",
                &["kind"]
            )
            .expect("Failed to register notifications_total"),

            telemetry_errors_total: register_int_counter_vec!(
                "run_monitor_telemetry_errors_total",
                "Per-node telemetry failures",
                &["kind"]
            )
            .expect("Failed to register telemetry_errors_total"),

            instance_types_known: register_int_gauge!(
                "run_monitor_instance_types_known",
                "Instance types in the vCPU catalog"
            )
            .expect("Failed to register instance_types_known"),
        }
    }
}

/// Lightweight handle to the process-wide monitor metrics
#[derive(Clone)]
pub struct MonitorMetrics {
    _private: (),
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MonitorMetricsInner {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    /// `outcome` is one of "completed", "skipped", "aborted"
    pub fn inc_ticks(&self, outcome: &str) {
        self.inner().ticks_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_idle_workloads(&self, count: i64) {
        self.inner().idle_workloads.set(count);
    }

    pub fn set_pressured_workloads(&self, count: i64) {
        self.inner().pressured_workloads.set(count);
    }

    pub fn inc_remediation(&self, action: &str) {
        self.inner()
            .remediation_actions_total
            .with_label_values(&[action])
            .inc();
    }

    pub fn add_notifications(&self, kind: &str, count: usize) {
        self.inner()
            .notifications_total
            .with_label_values(&[kind])
            .inc_by(count as u64);
    }

    pub fn inc_telemetry_errors(&self, kind: &str) {
        self.inner()
            .telemetry_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn set_instance_types_known(&self, count: i64) {
        self.inner().instance_types_known.set(count);
    }
}

/// Structured logger for monitor events
#[derive(Clone)]
pub struct MonitorLogger {
    instance: String,
}

impl MonitorLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_idle_detected(&self, run_id: u64, node: &str, cpu_fraction: f64, first: bool) {
        info!(
            event = "run_idle",
            instance = %self.instance,
            run_id = run_id,
            node = %node,
            cpu_fraction = cpu_fraction,
            first_notification = first,
            "Run is idle"
        );
    }

    pub fn log_idle_recovered(&self, run_id: u64, node: &str, cpu_fraction: f64) {
        info!(
            event = "run_idle_cleared",
            instance = %self.instance,
            run_id = run_id,
            node = %node,
            cpu_fraction = cpu_fraction,
            "Run is busy again, idle watermark cleared"
        );
    }

    pub fn log_remediation(&self, run_id: u64, action: &str, succeeded: bool) {
        if succeeded {
            info!(
                event = "remediation_applied",
                instance = %self.instance,
                run_id = run_id,
                action = %action,
                "Idle run remediated"
            );
        } else {
            warn!(
                event = "remediation_failed",
                instance = %self.instance,
                run_id = run_id,
                action = %action,
                "Idle run remediation failed, will retry next tick"
            );
        }
    }

    pub fn log_protected_skip(&self, run_id: u64, action: &str) {
        info!(
            event = "remediation_skipped",
            instance = %self.instance,
            run_id = run_id,
            action = %action,
            "Run is non-pausable or part of a cluster, leaving it alone"
        );
    }

    pub fn log_pressure(&self, run_id: u64, node: &str, exceeded: &str) {
        warn!(
            event = "run_under_pressure",
            instance = %self.instance,
            run_id = run_id,
            node = %node,
            exceeded = %exceeded,
            "Run exceeds resource thresholds"
        );
    }

    pub fn log_stuck_runs(&self, count: usize) {
        warn!(
            event = "runs_stuck_in_transition",
            instance = %self.instance,
            count = count,
            "Runs stuck in pausing or resuming"
        );
    }

    pub fn log_tick_skipped(&self, lock: &str) {
        info!(
            event = "tick_skipped",
            instance = %self.instance,
            lock = %lock,
            "Another instance holds the monitor lock"
        );
    }

    pub fn log_startup(&self, version: &str, backend: &str) {
        info!(
            event = "monitor_started",
            instance = %self.instance,
            version = %version,
            backend = %backend,
            "Run monitor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "monitor_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Run monitor shutting down"
        );
    }
}
