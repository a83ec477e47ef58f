//! One monitoring tick
//!
//! A tick takes the cluster-wide lease, loads the running workloads once and
//! runs three independent phases against that snapshot:
//! 1. idle detection and escalation
//! 2. resource pressure tagging
//! 3. stuck-transition sweep
//!
//! Every phase reads first and writes last. The lease is re-checked right
//! before each write batch; losing it ends the tick without further writes.

use super::catalog::InstanceTypeCatalog;
use super::idle::{average_cpu, evaluate_idle, recently_prolonged, IdleTransition};
use super::pressure::{evaluate_pressure, latest_fractions, PressureTransition};
use crate::error::{MonitorError, Result};
use crate::models::{InstanceType, RunStatus, RunTag, UsageRecord, Workload};
use crate::observability::{MonitorLogger, MonitorMetrics};
use crate::platform::{
    IdleNotice, IdleWatermarkUpdate, LeaseLock, NotificationKind, NotificationSink,
    PressureNotice, RunStore, TagChange,
};
use crate::policy::PolicyResolver;
use crate::telemetry::TelemetryBackend;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Name of the cluster-wide lease guarding ticks
pub const MONITOR_LOCK_NAME: &str = "resource-monitoring";

/// Upper bound a tick may hold the lease for
pub const MONITOR_LOCK_LEASE: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// What a tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Another instance held the lease
    pub skipped: bool,
    /// The lease was lost before a write batch
    pub aborted: bool,
    pub workloads: usize,
    pub idle_notified: Vec<u64>,
    pub paused: Vec<u64>,
    pub stopped: Vec<u64>,
    pub recovered: Vec<u64>,
    pub pressure_raised: Vec<u64>,
    pub pressure_cleared: Vec<u64>,
    pub stuck: Vec<u64>,
    /// Nodes whose telemetry could not be read
    pub node_errors: usize,
    /// Phases that failed and were skipped
    pub failed_phases: Vec<&'static str>,
}

impl TickReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn outcome(&self) -> &'static str {
        if self.skipped {
            "skipped"
        } else if self.aborted {
            "aborted"
        } else {
            "completed"
        }
    }
}

/// Writes one idle phase wants to make, computed before any is executed
#[derive(Debug, Default)]
struct IdlePlan {
    watermarks: Vec<IdleWatermarkUpdate>,
    tags: Vec<TagChange>,
    notices: Vec<IdleNotice>,
    pauses: Vec<IdleNotice>,
    stops: Vec<IdleNotice>,
    recovered: Vec<u64>,
}

impl IdlePlan {
    fn record(
        &mut self,
        run: &Workload,
        node: &str,
        cpu_fraction: f64,
        transition: IdleTransition,
        now: DateTime<Utc>,
    ) {
        let notice = |idle_since| IdleNotice {
            run_id: run.run_id,
            owner: run.owner.clone(),
            node_name: node.to_string(),
            cpu_fraction,
            idle_since,
        };

        match transition {
            IdleTransition::Stay | IdleTransition::Protected { .. } => {}
            IdleTransition::FirstNotify => {
                self.set_watermark(run.run_id, Some(now));
                if !run.has_tag(RunTag::Idle) {
                    self.tags.push(TagChange::add(run.run_id, RunTag::Idle));
                }
                self.notices.push(notice(Some(now)));
            }
            IdleTransition::Renotify => {
                self.set_watermark(run.run_id, Some(now));
                self.notices.push(notice(run.last_idle_notification_time));
            }
            IdleTransition::Pause => self.pauses.push(notice(run.last_idle_notification_time)),
            IdleTransition::Stop => self.stops.push(notice(run.last_idle_notification_time)),
            IdleTransition::Recovered => {
                self.clear(run);
                self.recovered.push(run.run_id);
            }
        }
    }

    fn set_watermark(&mut self, run_id: u64, at: Option<DateTime<Utc>>) {
        self.watermarks.push(IdleWatermarkUpdate {
            run_id,
            last_idle_notification_time: at,
        });
    }

    /// Back to the normal state: no watermark, no IDLE tag
    fn clear(&mut self, run: &Workload) {
        if run.last_idle_notification_time.is_some() {
            self.set_watermark(run.run_id, None);
        }
        if run.has_tag(RunTag::Idle) {
            self.tags.push(TagChange::remove(run.run_id, RunTag::Idle));
        }
    }
}

/// Drives monitoring ticks against injected collaborators
pub struct ResourceMonitor {
    telemetry: Arc<dyn TelemetryBackend>,
    runs: Arc<dyn RunStore>,
    notifications: Arc<dyn NotificationSink>,
    lock: Arc<dyn LeaseLock>,
    policy: PolicyResolver,
    catalog: InstanceTypeCatalog,
    lease: std::time::Duration,
    metrics: MonitorMetrics,
    logger: MonitorLogger,
}

impl ResourceMonitor {
    pub fn builder() -> ResourceMonitorBuilder {
        ResourceMonitorBuilder::new()
    }

    /// Refresh the vCPU catalog from an instance type feed emission
    pub fn update_instance_types(&self, types: Vec<InstanceType>) {
        self.catalog.update_instance_types(types);
        self.metrics.set_instance_types_known(self.catalog.len() as i64);
    }

    pub fn catalog(&self) -> &InstanceTypeCatalog {
        &self.catalog
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let started = Instant::now();

        let acquired = self
            .lock
            .try_acquire(MONITOR_LOCK_NAME, self.lease)
            .await
            .map_err(|e| {
                warn!(lock = MONITOR_LOCK_NAME, error = %e, "Failed to acquire monitor lock");
                MonitorError::LockUnavailable {
                    name: MONITOR_LOCK_NAME.to_string(),
                }
            })?;

        if !acquired {
            self.logger.log_tick_skipped(MONITOR_LOCK_NAME);
            self.metrics.inc_ticks("skipped");
            return Ok(TickReport::skipped());
        }

        let result = self.run_phases(now).await;

        if let Err(e) = self.lock.release(MONITOR_LOCK_NAME).await {
            warn!(lock = MONITOR_LOCK_NAME, error = %e, "Failed to release monitor lock");
        }

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.metrics.inc_ticks("failed");
                return Err(e);
            }
        };
        self.metrics.inc_ticks(report.outcome());
        self.metrics
            .observe_tick_latency(started.elapsed().as_secs_f64());

        info!(
            workloads = report.workloads,
            idle_notified = report.idle_notified.len(),
            paused = report.paused.len(),
            stopped = report.stopped.len(),
            pressure_raised = report.pressure_raised.len(),
            stuck = report.stuck.len(),
            node_errors = report.node_errors,
            aborted = report.aborted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Monitoring tick finished"
        );
        Ok(report)
    }

    async fn run_phases(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let workloads = self
            .runs
            .list_running()
            .await
            .map_err(|e| MonitorError::Store(format!("listing running runs: {}", e)))?;

        let mut report = TickReport {
            workloads: workloads.len(),
            ..TickReport::default()
        };

        self.metrics.set_idle_workloads(
            workloads.iter().filter(|w| w.has_tag(RunTag::Idle)).count() as i64,
        );
        self.metrics.set_pressured_workloads(
            workloads.iter().filter(|w| w.has_tag(RunTag::Pressure)).count() as i64,
        );

        let idle = self.idle_phase(&workloads, now, &mut report).await;
        if !self.settle_phase("idle", idle, &mut report) {
            return Ok(report);
        }

        let pressure = self.pressure_phase(&workloads, now, &mut report).await;
        if !self.settle_phase("pressure", pressure, &mut report) {
            return Ok(report);
        }

        let stuck = self.stuck_phase(&mut report).await;
        self.settle_phase("stuck", stuck, &mut report);

        Ok(report)
    }

    /// Log a phase failure. Returns false when the tick must stop here.
    fn settle_phase(&self, phase: &'static str, result: Result<()>, report: &mut TickReport) -> bool {
        match result {
            Ok(()) => true,
            Err(MonitorError::LockUnavailable { name }) => {
                warn!(phase = phase, lock = %name, "Monitor lock lost, aborting tick");
                report.aborted = true;
                false
            }
            Err(e) => {
                error!(phase = phase, error = %e, "Monitoring phase failed");
                report.failed_phases.push(phase);
                true
            }
        }
    }

    /// Fail unless this instance still holds the lease
    async fn ensure_lock(&self) -> Result<()> {
        match self.lock.is_held(MONITOR_LOCK_NAME).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(MonitorError::LockUnavailable {
                name: MONITOR_LOCK_NAME.to_string(),
            }),
            Err(e) => {
                warn!(lock = MONITOR_LOCK_NAME, error = %e, "Failed to verify monitor lock");
                Err(MonitorError::LockUnavailable {
                    name: MONITOR_LOCK_NAME.to_string(),
                })
            }
        }
    }

    /// Group runs by node, dropping runs not scheduled anywhere yet
    fn group_by_node<'a>(
        workloads: impl IntoIterator<Item = &'a Workload>,
    ) -> BTreeMap<&'a str, Vec<&'a Workload>> {
        let mut by_node: BTreeMap<&str, Vec<&Workload>> = BTreeMap::new();
        for workload in workloads {
            match workload.node_name.as_deref() {
                Some(node) => by_node.entry(node).or_default().push(workload),
                None => debug!(run_id = workload.run_id, "Run has no node yet, skipping"),
            }
        }
        by_node
    }

    /// Fetch usage per node. Failed nodes are missing from the result.
    async fn fetch_usage(
        &self,
        nodes: &[&str],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        report: &mut TickReport,
    ) -> HashMap<String, Vec<UsageRecord>> {
        let mut usage = HashMap::new();
        for &node in nodes {
            match self.telemetry.fetch(node, from, to, None).await {
                Ok(records) => {
                    usage.insert(node.to_string(), records);
                }
                Err(e) => {
                    report.node_errors += 1;
                    if e.is_transport() {
                        self.metrics.inc_telemetry_errors("transport");
                        error!(node = %node, error = %e, "Telemetry transport failure");
                    } else {
                        self.metrics.inc_telemetry_errors("no_data");
                        warn!(node = %node, error = %e, "No usable telemetry for node");
                    }
                }
            }
        }
        usage
    }

    async fn idle_phase(
        &self,
        workloads: &[Workload],
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let settings = self.policy.idle_settings().await?;

        let by_node = Self::group_by_node(
            workloads
                .iter()
                .filter(|w| !recently_prolonged(w, settings.idle_timeout_minutes, now)),
        );
        if by_node.is_empty() {
            return Ok(());
        }

        let from = now - Duration::minutes(settings.idle_timeout_minutes + 1);
        let nodes: Vec<&str> = by_node.keys().copied().collect();
        let usage = self.fetch_usage(&nodes, from, now, report).await;

        let mut plan = IdlePlan::default();
        for (node, runs) in &by_node {
            let Some(cpu) = usage.get(*node).and_then(|records| average_cpu(records)) else {
                debug!(node = %node, "No CPU data for node this tick");
                continue;
            };

            for run in runs {
                let vcpus = self.catalog.vcpus_for(run.instance_type.as_deref());
                let fraction = cpu / f64::from(vcpus);
                let transition = evaluate_idle(run, fraction, &settings, now);

                match transition {
                    IdleTransition::FirstNotify => {
                        self.logger.log_idle_detected(run.run_id, node, fraction, true)
                    }
                    IdleTransition::Renotify => {
                        self.logger.log_idle_detected(run.run_id, node, fraction, false)
                    }
                    IdleTransition::Recovered => {
                        self.logger.log_idle_recovered(run.run_id, node, fraction)
                    }
                    IdleTransition::Protected { action } => {
                        self.logger.log_protected_skip(run.run_id, &action.to_string())
                    }
                    IdleTransition::Stay | IdleTransition::Pause | IdleTransition::Stop => {}
                }
                plan.record(run, node, fraction, transition, now);
            }
        }

        self.apply_idle_plan(plan, workloads, report).await
    }

    async fn apply_idle_plan(
        &self,
        mut plan: IdlePlan,
        workloads: &[Workload],
        report: &mut TickReport,
    ) -> Result<()> {
        self.ensure_lock().await?;

        let by_id: HashMap<u64, &Workload> = workloads.iter().map(|w| (w.run_id, w)).collect();

        let mut paused = Vec::new();
        for notice in std::mem::take(&mut plan.pauses) {
            let succeeded = match self.runs.pause(notice.run_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(run_id = notice.run_id, error = %e, "Pause call failed");
                    false
                }
            };
            self.logger.log_remediation(notice.run_id, "pause", succeeded);
            if succeeded {
                self.metrics.inc_remediation("pause");
                if let Some(run) = by_id.get(&notice.run_id) {
                    plan.clear(run);
                }
                paused.push(notice);
            }
        }

        let mut stopped = Vec::new();
        for notice in std::mem::take(&mut plan.stops) {
            let succeeded = match self.runs.stop(notice.run_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(run_id = notice.run_id, error = %e, "Stop call failed");
                    false
                }
            };
            self.logger.log_remediation(notice.run_id, "stop", succeeded);
            if succeeded {
                self.metrics.inc_remediation("stop");
                if let Some(run) = by_id.get(&notice.run_id) {
                    plan.clear(run);
                }
                stopped.push(notice);
            }
        }

        if !plan.watermarks.is_empty() {
            self.runs
                .persist_idle_watermarks(&plan.watermarks)
                .await
                .map_err(|e| MonitorError::Store(format!("persisting idle watermarks: {}", e)))?;
        }
        if !plan.tags.is_empty() {
            self.runs
                .persist_tags(&plan.tags)
                .await
                .map_err(|e| MonitorError::Store(format!("persisting idle tags: {}", e)))?;
        }

        self.send_idle(&plan.notices, NotificationKind::IdleRun).await;
        self.send_idle(&paused, NotificationKind::IdleRunPaused).await;
        self.send_idle(&stopped, NotificationKind::IdleRunStopped).await;

        report.idle_notified = plan.notices.iter().map(|n| n.run_id).collect();
        report.paused = paused.iter().map(|n| n.run_id).collect();
        report.stopped = stopped.iter().map(|n| n.run_id).collect();
        report.recovered = plan.recovered;
        Ok(())
    }

    async fn send_idle(&self, batch: &[IdleNotice], kind: NotificationKind) {
        if batch.is_empty() {
            return;
        }
        match self.notifications.notify_idle(batch, kind).await {
            Ok(()) => self.metrics.add_notifications(&kind.to_string(), batch.len()),
            Err(e) => warn!(kind = %kind, count = batch.len(), error = %e, "Failed to send idle notifications"),
        }
    }

    async fn pressure_phase(
        &self,
        workloads: &[Workload],
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let settings = self.policy.pressure_settings().await?;

        let by_node = Self::group_by_node(workloads);
        if by_node.is_empty() {
            return Ok(());
        }

        let from = now - Duration::minutes(settings.time_range_minutes + 1);
        let nodes: Vec<&str> = by_node.keys().copied().collect();
        let usage = self.fetch_usage(&nodes, from, now, report).await;

        let mut tags = Vec::new();
        let mut notices = Vec::new();
        let mut cleared = Vec::new();
        for (node, runs) in &by_node {
            let Some(records) = usage.get(*node) else {
                continue;
            };
            let observed = latest_fractions(records);
            if observed.is_empty() {
                debug!(node = %node, "No memory or filesystem data for node this tick");
                continue;
            }

            for run in runs {
                match evaluate_pressure(run, &observed, &settings.thresholds) {
                    PressureTransition::Raised { exceeded } => {
                        let summary = exceeded
                            .iter()
                            .map(|(metric, value)| format!("{}={:.3}", metric, value))
                            .collect::<Vec<_>>()
                            .join(",");
                        self.logger.log_pressure(run.run_id, node, &summary);

                        tags.push(TagChange::add(run.run_id, RunTag::Pressure));
                        notices.push(PressureNotice {
                            run_id: run.run_id,
                            owner: run.owner.clone(),
                            node_name: node.to_string(),
                            exceeded,
                        });
                    }
                    PressureTransition::Cleared => {
                        debug!(run_id = run.run_id, node = %node, "Run no longer under pressure");
                        tags.push(TagChange::remove(run.run_id, RunTag::Pressure));
                        cleared.push(run.run_id);
                    }
                    PressureTransition::Stay => {}
                }
            }
        }

        if tags.is_empty() {
            return Ok(());
        }

        self.ensure_lock().await?;

        self.runs
            .persist_tags(&tags)
            .await
            .map_err(|e| MonitorError::Store(format!("persisting pressure tags: {}", e)))?;

        if !notices.is_empty() {
            let kind = NotificationKind::HighConsumingResources;
            match self.notifications.notify_pressure(&notices, kind).await {
                Ok(()) => self.metrics.add_notifications(&kind.to_string(), notices.len()),
                Err(e) => warn!(count = notices.len(), error = %e, "Failed to send pressure notifications"),
            }
        }

        report.pressure_raised = notices.iter().map(|n| n.run_id).collect();
        report.pressure_cleared = cleared;
        Ok(())
    }

    async fn stuck_phase(&self, report: &mut TickReport) -> Result<()> {
        let stuck = self
            .runs
            .list_by_status(&[RunStatus::Pausing, RunStatus::Resuming])
            .await
            .map_err(|e| MonitorError::Store(format!("listing transitional runs: {}", e)))?;

        if stuck.is_empty() {
            return Ok(());
        }

        self.logger.log_stuck_runs(stuck.len());
        self.ensure_lock().await?;

        self.notifications
            .notify_stuck_transitions(&stuck)
            .await
            .map_err(|e| MonitorError::Notification(e.to_string()))?;
        self.metrics
            .add_notifications(&NotificationKind::StuckInStatus.to_string(), stuck.len());

        report.stuck = stuck.iter().map(|w| w.run_id).collect();
        Ok(())
    }
}

/// Builder for `ResourceMonitor`
pub struct ResourceMonitorBuilder {
    telemetry: Option<Arc<dyn TelemetryBackend>>,
    runs: Option<Arc<dyn RunStore>>,
    notifications: Option<Arc<dyn NotificationSink>>,
    lock: Option<Arc<dyn LeaseLock>>,
    policy: Option<PolicyResolver>,
    lease: std::time::Duration,
    instance: String,
}

impl ResourceMonitorBuilder {
    pub fn new() -> Self {
        Self {
            telemetry: None,
            runs: None,
            notifications: None,
            lock: None,
            policy: None,
            lease: MONITOR_LOCK_LEASE,
            instance: "run-monitor".to_string(),
        }
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetryBackend>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn run_store(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn notifications(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn LeaseLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn policy(mut self, policy: PolicyResolver) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Override the lease length (default ten minutes)
    pub fn lease(mut self, lease: std::time::Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Name used in structured log events
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn build(self) -> anyhow::Result<ResourceMonitor> {
        let required = |what: &str| anyhow::anyhow!("{} is required", what);

        Ok(ResourceMonitor {
            telemetry: self.telemetry.ok_or_else(|| required("Telemetry backend"))?,
            runs: self.runs.ok_or_else(|| required("Run store"))?,
            notifications: self.notifications.ok_or_else(|| required("Notification sink"))?,
            lock: self.lock.ok_or_else(|| required("Lease lock"))?,
            policy: self.policy.ok_or_else(|| required("Policy resolver"))?,
            catalog: InstanceTypeCatalog::new(),
            lease: self.lease,
            metrics: MonitorMetrics::new(),
            logger: MonitorLogger::new(self.instance),
        })
    }
}

impl Default for ResourceMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
