//! Monitoring orchestrator
//!
//! `ResourceMonitor` owns one tick: idle detection, pressure tagging and the
//! stuck-transition sweep. Decisions are pure functions in `idle` and
//! `pressure`; all side effects happen in the orchestrator's batch-apply
//! steps. `MonitorLoop` runs ticks on a fixed schedule.

mod catalog;
mod idle;
mod r#loop;
mod orchestrator;
mod pressure;


pub use catalog::{InstanceTypeCatalog, DEFAULT_VCPUS};
pub use idle::{
    average_cpu, compare_with_tolerance, evaluate_idle, recently_prolonged, IdleState,
    IdleTransition, COMPARISON_TOLERANCE,
};
pub use orchestrator::{
    ResourceMonitor, ResourceMonitorBuilder, TickReport, MONITOR_LOCK_LEASE, MONITOR_LOCK_NAME,
};
pub use pressure::{evaluate_pressure, exceeded_metrics, latest_fractions, PressureTransition};
pub use r#loop::MonitorLoop;
