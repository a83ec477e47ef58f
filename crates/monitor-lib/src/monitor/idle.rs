//! Idle detection state machine
//!
//! Each workload is in one of two states, derived from its persisted idle
//! watermark: `Normal` (no watermark) or `IdleNotified { since }`. Once per
//! tick a fresh CPU observation is fed through `evaluate_idle`, which only
//! decides. Executing the decision (persisting, notifying, pausing) is the
//! orchestrator's batch-apply step.

use crate::models::{RunTag, UsageRecord, Workload};
use crate::policy::{IdleSettings, RemediationAction};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;

/// Differences smaller than this are treated as equal to avoid flapping
pub const COMPARISON_TOLERANCE: f64 = 0.001;

/// Compare two fractions, treating values within `COMPARISON_TOLERANCE` as equal
pub fn compare_with_tolerance(value: f64, threshold: f64) -> Ordering {
    let diff = value - threshold;
    if diff.abs() <= COMPARISON_TOLERANCE {
        Ordering::Equal
    } else if diff < 0.0 {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Normal,
    IdleNotified { since: DateTime<Utc> },
}

impl IdleState {
    pub fn of(workload: &Workload) -> Self {
        match workload.last_idle_notification_time {
            Some(since) => IdleState::IdleNotified { since },
            None => IdleState::Normal,
        }
    }
}

/// Decision taken for one workload in one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTransition {
    /// Nothing to persist or send
    Stay,
    /// First idle observation: set watermark, tag IDLE, notify
    FirstNotify,
    /// Action timeout reached but the action is notify-only: notify, reset watermark
    Renotify,
    /// Pause the run and clear its watermark
    Pause,
    /// Stop the run and clear its watermark
    Stop,
    /// Pause/stop was due but the run must not be touched
    Protected { action: RemediationAction },
    /// Busy: clear watermark and IDLE tag, no notification
    Recovered,
}

/// Decide the transition for one workload from its current state and CPU fraction
pub fn evaluate_idle(
    workload: &Workload,
    cpu_fraction: f64,
    settings: &IdleSettings,
    now: DateTime<Utc>,
) -> IdleTransition {
    let idle = compare_with_tolerance(cpu_fraction, settings.idle_cpu_fraction) == Ordering::Less;

    match (IdleState::of(workload), idle) {
        // IDLE tag left behind after the watermark was cleared elsewhere
        (IdleState::Normal, false) if workload.has_tag(RunTag::Idle) => IdleTransition::Recovered,
        (IdleState::Normal, false) => IdleTransition::Stay,
        (IdleState::Normal, true) => IdleTransition::FirstNotify,
        (IdleState::IdleNotified { .. }, false) => IdleTransition::Recovered,
        (IdleState::IdleNotified { since }, true) => {
            if now - since < Duration::minutes(settings.idle_action_timeout_minutes) {
                return IdleTransition::Stay;
            }
            escalate(workload, settings.remediation_action)
        }
    }
}

/// Escalation table for a run whose action timeout has elapsed
fn escalate(workload: &Workload, action: RemediationAction) -> IdleTransition {
    let transition = match (action, workload.is_spot) {
        (RemediationAction::Notify, _) => IdleTransition::Renotify,
        (RemediationAction::Pause, true) => IdleTransition::Renotify,
        (RemediationAction::Pause, false) => IdleTransition::Pause,
        (RemediationAction::PauseOrStop, true) => IdleTransition::Stop,
        (RemediationAction::PauseOrStop, false) => IdleTransition::Pause,
        (RemediationAction::Stop, _) => IdleTransition::Stop,
    };

    match transition {
        IdleTransition::Pause | IdleTransition::Stop if workload.is_action_protected() => {
            IdleTransition::Protected { action }
        }
        other => other,
    }
}

/// Whether the run was prolonged (or started) too recently to be checked
pub fn recently_prolonged(workload: &Workload, idle_timeout_minutes: i64, now: DateTime<Utc>) -> bool {
    let prolonged_at = workload.prolonged_at.unwrap_or(workload.started_at);
    now - prolonged_at <= Duration::minutes(idle_timeout_minutes)
}

/// Mean CPU load across records that carry a CPU value
pub fn average_cpu(records: &[UsageRecord]) -> Option<f64> {
    let values: Vec<f64> = records.iter().filter_map(|r| r.cpu).collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
