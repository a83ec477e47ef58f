//! Threshold and remediation policy
//!
//! Values are read through from a `PolicyStore` on every call. Operators may
//! change them while the monitor runs, so nothing here is cached.

use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

pub const IDLE_CPU_FRACTION: &str = "monitoring.idle_cpu_fraction";
pub const IDLE_TIMEOUT_MINUTES: &str = "monitoring.idle_timeout_minutes";
pub const IDLE_ACTION_TIMEOUT_MINUTES: &str = "monitoring.idle_action_timeout_minutes";
pub const IDLE_ACTION: &str = "monitoring.idle_action";
pub const PRESSURE_MEMORY_FRACTION: &str = "monitoring.pressure_memory_fraction";
pub const PRESSURE_FILESYSTEM_FRACTION: &str = "monitoring.pressure_filesystem_fraction";
pub const TIME_RANGE_MINUTES: &str = "monitoring.time_range_minutes";

/// What to do with a run that stays idle past the action timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemediationAction {
    Notify,
    Pause,
    PauseOrStop,
    Stop,
}

impl FromStr for RemediationAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NOTIFY" => Ok(RemediationAction::Notify),
            "PAUSE" => Ok(RemediationAction::Pause),
            "PAUSE_OR_STOP" => Ok(RemediationAction::PauseOrStop),
            "STOP" => Ok(RemediationAction::Stop),
            other => Err(format!("unknown remediation action '{}'", other)),
        }
    }
}

impl std::fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemediationAction::Notify => write!(f, "NOTIFY"),
            RemediationAction::Pause => write!(f, "PAUSE"),
            RemediationAction::PauseOrStop => write!(f, "PAUSE_OR_STOP"),
            RemediationAction::Stop => write!(f, "STOP"),
        }
    }
}

/// Metrics that can put a run under pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PressureMetric {
    Memory,
    Filesystem,
}

impl std::fmt::Display for PressureMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PressureMetric::Memory => write!(f, "memory"),
            PressureMetric::Filesystem => write!(f, "filesystem"),
        }
    }
}

/// Full threshold configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSet {
    pub idle_cpu_fraction: f64,
    pub pressure_fraction_by_metric: BTreeMap<PressureMetric, f64>,
    pub idle_action_timeout_minutes: i64,
    pub idle_timeout_minutes: i64,
    pub remediation_action: RemediationAction,
}

/// Policy values the idle phase needs
#[derive(Debug, Clone, PartialEq)]
pub struct IdleSettings {
    pub idle_cpu_fraction: f64,
    pub idle_timeout_minutes: i64,
    pub idle_action_timeout_minutes: i64,
    pub remediation_action: RemediationAction,
}

/// Policy values the pressure phase needs
#[derive(Debug, Clone, PartialEq)]
pub struct PressureSettings {
    pub thresholds: BTreeMap<PressureMetric, f64>,
    pub time_range_minutes: i64,
}

/// Raw key/value preference source
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn preference(&self, key: &str) -> anyhow::Result<Option<String>>;
}

/// Typed read-through accessor over a `PolicyStore`
#[derive(Clone)]
pub struct PolicyResolver {
    store: Arc<dyn PolicyStore>,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    async fn required<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self
            .store
            .preference(key)
            .await
            .map_err(|e| MonitorError::configuration(key, e.to_string()))?
            .ok_or_else(|| MonitorError::configuration(key, "value is not set"))?;

        raw.trim()
            .parse()
            .map_err(|e: T::Err| MonitorError::configuration(key, format!("'{}': {}", raw, e)))
    }

    pub async fn idle_cpu_fraction(&self) -> Result<f64> {
        self.required(IDLE_CPU_FRACTION).await
    }

    /// Pressure thresholds, keyed by exactly MEMORY and FILESYSTEM
    pub async fn pressure_thresholds(&self) -> Result<BTreeMap<PressureMetric, f64>> {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(
            PressureMetric::Memory,
            self.required(PRESSURE_MEMORY_FRACTION).await?,
        );
        thresholds.insert(
            PressureMetric::Filesystem,
            self.required(PRESSURE_FILESYSTEM_FRACTION).await?,
        );
        Ok(thresholds)
    }

    pub async fn idle_timeout_minutes(&self) -> Result<i64> {
        self.required(IDLE_TIMEOUT_MINUTES).await
    }

    pub async fn idle_action_timeout_minutes(&self) -> Result<i64> {
        self.required(IDLE_ACTION_TIMEOUT_MINUTES).await
    }

    pub async fn remediation_action(&self) -> Result<RemediationAction> {
        self.required(IDLE_ACTION).await
    }

    pub async fn monitoring_time_range_minutes(&self) -> Result<i64> {
        self.required(TIME_RANGE_MINUTES).await
    }

    pub async fn idle_settings(&self) -> Result<IdleSettings> {
        Ok(IdleSettings {
            idle_cpu_fraction: self.idle_cpu_fraction().await?,
            idle_timeout_minutes: self.idle_timeout_minutes().await?,
            idle_action_timeout_minutes: self.idle_action_timeout_minutes().await?,
            remediation_action: self.remediation_action().await?,
        })
    }

    pub async fn pressure_settings(&self) -> Result<PressureSettings> {
        Ok(PressureSettings {
            thresholds: self.pressure_thresholds().await?,
            time_range_minutes: self.monitoring_time_range_minutes().await?,
        })
    }

    pub async fn threshold_set(&self) -> Result<ThresholdSet> {
        let idle = self.idle_settings().await?;
        Ok(ThresholdSet {
            idle_cpu_fraction: idle.idle_cpu_fraction,
            pressure_fraction_by_metric: self.pressure_thresholds().await?,
            idle_action_timeout_minutes: idle.idle_action_timeout_minutes,
            idle_timeout_minutes: idle.idle_timeout_minutes,
            remediation_action: idle.remediation_action,
        })
    }
}

/// Policy store reading a TOML/JSON/YAML file on every lookup
pub struct FilePolicyStore {
    path: PathBuf,
}

impl FilePolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PolicyStore for FilePolicyStore {
    async fn preference(&self, key: &str) -> anyhow::Result<Option<String>> {
        let settings = config::Config::builder()
            .add_source(config::File::from(self.path.as_path()))
            .build()?;

        match settings.get_string(key) {
            Ok(value) => Ok(Some(value)),
            Err(config::ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_policy(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const FULL_POLICY: &str = r#"
[monitoring]
idle_cpu_fraction = 0.1
idle_timeout_minutes = 30
idle_action_timeout_minutes = 30
idle_action = "pause_or_stop"
pressure_memory_fraction = 0.85
pressure_filesystem_fraction = 0.9
time_range_minutes = 5
"#;

    #[test]
    fn test_parse_remediation_action() {
        let parse = |s: &str| s.parse::<RemediationAction>();
        assert_eq!(parse("NOTIFY").unwrap(), RemediationAction::Notify);
        assert_eq!(parse("pause").unwrap(), RemediationAction::Pause);
        assert_eq!(parse(" PAUSE_OR_STOP ").unwrap(), RemediationAction::PauseOrStop);
        assert_eq!(parse("Stop").unwrap(), RemediationAction::Stop);
        assert!("terminate".parse::<RemediationAction>().is_err());
    }

    #[tokio::test]
    async fn test_file_policy_threshold_set() {
        let file = write_policy(FULL_POLICY);
        let resolver = PolicyResolver::new(Arc::new(FilePolicyStore::new(file.path())));

        let thresholds = tokio_test::assert_ok!(resolver.threshold_set().await);
        assert_eq!(thresholds.idle_cpu_fraction, 0.1);
        assert_eq!(thresholds.idle_timeout_minutes, 30);
        assert_eq!(thresholds.remediation_action, RemediationAction::PauseOrStop);
        assert_eq!(thresholds.pressure_fraction_by_metric.len(), 2);
        assert_eq!(
            thresholds.pressure_fraction_by_metric[&PressureMetric::Memory],
            0.85
        );
    }

    #[tokio::test]
    async fn test_missing_value_is_configuration_error() {
        let file = write_policy("[monitoring]\nidle_cpu_fraction = 0.1\n");
        let resolver = PolicyResolver::new(Arc::new(FilePolicyStore::new(file.path())));

        assert!(resolver.idle_cpu_fraction().await.is_ok());
        let err = resolver.pressure_settings().await.unwrap_err();
        assert!(matches!(err, MonitorError::Configuration { ref key, .. } if key == PRESSURE_MEMORY_FRACTION));
    }

    #[tokio::test]
    async fn test_edits_are_seen_without_restart() {
        let file = write_policy("[monitoring]\nidle_cpu_fraction = 0.1\n");
        let resolver = PolicyResolver::new(Arc::new(FilePolicyStore::new(file.path())));
        assert_eq!(resolver.idle_cpu_fraction().await.unwrap(), 0.1);

        std::fs::write(file.path(), "[monitoring]\nidle_cpu_fraction = 0.25\n").unwrap();
        assert_eq!(resolver.idle_cpu_fraction().await.unwrap(), 0.25);
    }

    #[tokio::test]
    async fn test_malformed_value_is_configuration_error() {
        let file = write_policy("[monitoring]\nidle_action = \"reboot\"\n");
        let resolver = PolicyResolver::new(Arc::new(FilePolicyStore::new(file.path())));

        assert!(matches!(
            resolver.remediation_action().await,
            Err(MonitorError::Configuration { .. })
        ));
    }
}
