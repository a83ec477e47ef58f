//! Pressure evaluation. Alert-only: no timeouts, no escalation.

use super::idle::compare_with_tolerance;
use crate::models::{RunTag, UsageRecord, Workload};
use crate::policy::PressureMetric;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum PressureTransition {
    Stay,
    /// Newly over a threshold: tag and notify once
    Raised { exceeded: BTreeMap<PressureMetric, f64> },
    /// Back under every threshold: drop the tag
    Cleared,
}

/// Latest observed fraction per metric; metrics without data are absent
pub fn latest_fractions(records: &[UsageRecord]) -> BTreeMap<PressureMetric, f64> {
    let mut fractions = BTreeMap::new();
    let latest = |f: fn(&UsageRecord) -> Option<f64>| records.iter().rev().find_map(f);

    if let Some(memory) = latest(UsageRecord::memory_fraction) {
        fractions.insert(PressureMetric::Memory, memory);
    }
    if let Some(filesystem) = latest(UsageRecord::filesystem_fraction) {
        fractions.insert(PressureMetric::Filesystem, filesystem);
    }
    fractions
}

/// Metrics whose observed fraction is above threshold
pub fn exceeded_metrics(
    observed: &BTreeMap<PressureMetric, f64>,
    thresholds: &BTreeMap<PressureMetric, f64>,
) -> BTreeMap<PressureMetric, f64> {
    observed
        .iter()
        .filter(|(metric, value)| {
            thresholds
                .get(metric)
                .map(|threshold| compare_with_tolerance(**value, *threshold) == Ordering::Greater)
                .unwrap_or(false)
        })
        .map(|(metric, value)| (*metric, *value))
        .collect()
}

/// Any metric over threshold puts the run under pressure
pub fn evaluate_pressure(
    workload: &Workload,
    observed: &BTreeMap<PressureMetric, f64>,
    thresholds: &BTreeMap<PressureMetric, f64>,
) -> PressureTransition {
    let exceeded = exceeded_metrics(observed, thresholds);
    let tagged = workload.has_tag(RunTag::Pressure);

    match (exceeded.is_empty(), tagged) {
        (false, false) => PressureTransition::Raised { exceeded },
        (true, true) => PressureTransition::Cleared,
        _ => PressureTransition::Stay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiskUsage, MemoryUsage, RunStatus};
    use chrono::{Duration, Utc};
    use std::collections::{BTreeSet, HashMap};

    fn workload(tags: &[RunTag]) -> Workload {
        Workload {
            run_id: 7,
            owner: "bob".to_string(),
            status: RunStatus::Running,
            node_name: Some("node-7".to_string()),
            instance_type: None,
            pod_id: None,
            docker_image: None,
            started_at: Utc::now() - Duration::hours(1),
            prolonged_at: None,
            is_spot: false,
            non_pausable: false,
            cluster_member: false,
            last_idle_notification_time: None,
            tags: tags.iter().copied().collect::<BTreeSet<_>>(),
            restart_lineage: Vec::new(),
        }
    }

    fn thresholds() -> BTreeMap<PressureMetric, f64> {
        BTreeMap::from([(PressureMetric::Memory, 0.85), (PressureMetric::Filesystem, 0.9)])
    }

    #[test]
    fn test_any_metric_raises_pressure_once() {
        let observed = BTreeMap::from([(PressureMetric::Memory, 0.92), (PressureMetric::Filesystem, 0.95)]);

        match evaluate_pressure(&workload(&[]), &observed, &thresholds()) {
            PressureTransition::Raised { exceeded } => assert_eq!(exceeded.len(), 2),
            other => panic!("unexpected transition {:?}", other),
        }
    }

    #[test]
    fn test_tagged_run_stays_under_pressure() {
        let observed = BTreeMap::from([(PressureMetric::Memory, 0.92)]);
        assert_eq!(
            evaluate_pressure(&workload(&[RunTag::Pressure]), &observed, &thresholds()),
            PressureTransition::Stay
        );
    }

    #[test]
    fn test_tag_cleared_when_back_under_threshold() {
        let observed = BTreeMap::from([(PressureMetric::Memory, 0.5), (PressureMetric::Filesystem, 0.2)]);
        assert_eq!(
            evaluate_pressure(&workload(&[RunTag::Pressure]), &observed, &thresholds()),
            PressureTransition::Cleared
        );
    }

    #[test]
    fn test_value_within_tolerance_does_not_exceed() {
        let observed = BTreeMap::from([(PressureMetric::Memory, 0.8505)]);
        assert!(exceeded_metrics(&observed, &thresholds()).is_empty());
    }

    #[test]
    fn test_latest_fractions_prefers_newest_record() {
        let start = Utc::now();
        let mut older = UsageRecord::new(start, start + Duration::minutes(1)).unwrap();
        older.memory = Some(MemoryUsage {
            capacity_bytes: 100,
            used_bytes: 10,
        });
        older.disks = Some(HashMap::from([(
            "sda".to_string(),
            DiskUsage {
                capacity_bytes: 100,
                usable_bytes: 5,
            },
        )]));
        let mut newer = UsageRecord::new(start + Duration::minutes(1), start + Duration::minutes(2)).unwrap();
        newer.memory = Some(MemoryUsage {
            capacity_bytes: 100,
            used_bytes: 90,
        });

        let fractions = latest_fractions(&[older, newer]);
        assert!((fractions[&PressureMetric::Memory] - 0.9).abs() < 1e-9);
        assert!((fractions[&PressureMetric::Filesystem] - 0.95).abs() < 1e-9);
    }
}
