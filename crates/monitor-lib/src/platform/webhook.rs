//! Notification delivery over an Alertmanager-compatible webhook
//!
//! Each batch call becomes exactly one POST carrying one alert per run.
//! Rendering and routing to users happens downstream.

use super::{IdleNotice, NotificationKind, NotificationSink, PressureNotice};
use crate::models::Workload;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Alertmanager webhook alert format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    /// Alert status (always "firing" here)
    pub status: String,
    /// Alert labels for routing and grouping
    pub labels: HashMap<String, String>,
    /// Alert annotations with details
    pub annotations: HashMap<String, String>,
    /// Start time in RFC3339 format
    pub starts_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator_url: Option<String>,
}

/// Alertmanager webhook payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertmanagerPayload {
    pub alerts: Vec<AlertmanagerAlert>,
}

fn alert_name(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::IdleRun => "RunIdle",
        NotificationKind::IdleRunPaused => "RunIdlePaused",
        NotificationKind::IdleRunStopped => "RunIdleStopped",
        NotificationKind::HighConsumingResources => "RunHighResourceConsumption",
        NotificationKind::StuckInStatus => "RunStuckInStatus",
    }
}

/// Notification sink that posts batches to a webhook
pub struct WebhookNotifier {
    client: Client,
    url: Url,
    component_name: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: Url::parse(url).context("Invalid webhook URL")?,
            component_name: "run-monitor".to_string(),
        })
    }

    fn base_alert(&self, kind: NotificationKind, run_id: u64, owner: &str) -> AlertmanagerAlert {
        let mut labels = HashMap::new();
        labels.insert("alertname".to_string(), alert_name(kind).to_string());
        labels.insert("kind".to_string(), kind.to_string());
        labels.insert("run_id".to_string(), run_id.to_string());
        labels.insert("owner".to_string(), owner.to_string());
        labels.insert("source".to_string(), self.component_name.clone());

        AlertmanagerAlert {
            status: "firing".to_string(),
            labels,
            annotations: HashMap::new(),
            starts_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            generator_url: None,
        }
    }

    /// Build an alert for an idle run
    pub fn idle_alert(&self, notice: &IdleNotice, kind: NotificationKind) -> AlertmanagerAlert {
        let mut alert = self.base_alert(kind, notice.run_id, &notice.owner);
        alert
            .labels
            .insert("node".to_string(), notice.node_name.clone());

        let action = match kind {
            NotificationKind::IdleRunPaused => " and has been paused",
            NotificationKind::IdleRunStopped => " and has been stopped",
            _ => "",
        };
        alert.annotations.insert(
            "summary".to_string(),
            format!("Run {} is idle{}", notice.run_id, action),
        );
        alert.annotations.insert(
            "description".to_string(),
            format!(
                "CPU utilization is {:.1}% of the instance capacity.",
                notice.cpu_fraction * 100.0
            ),
        );
        alert.annotations.insert(
            "cpu_fraction".to_string(),
            format!("{:.4}", notice.cpu_fraction),
        );
        if let Some(since) = notice.idle_since {
            alert
                .annotations
                .insert("idle_since".to_string(), since.to_rfc3339());
        }
        alert
    }

    /// Build an alert for a run under resource pressure
    pub fn pressure_alert(
        &self,
        notice: &PressureNotice,
        kind: NotificationKind,
    ) -> AlertmanagerAlert {
        let mut alert = self.base_alert(kind, notice.run_id, &notice.owner);
        alert
            .labels
            .insert("node".to_string(), notice.node_name.clone());

        let details: Vec<String> = notice
            .exceeded
            .iter()
            .map(|(metric, value)| format!("{} {:.1}%", metric, value * 100.0))
            .collect();
        alert.annotations.insert(
            "summary".to_string(),
            format!("Run {} is consuming too many resources", notice.run_id),
        );
        alert
            .annotations
            .insert("description".to_string(), details.join(", "));
        for (metric, value) in &notice.exceeded {
            alert
                .annotations
                .insert(format!("{}_fraction", metric), format!("{:.4}", value));
        }
        alert
    }

    /// Build an alert for a run stuck in a transitional status
    pub fn stuck_alert(&self, run: &Workload) -> AlertmanagerAlert {
        let mut alert = self.base_alert(NotificationKind::StuckInStatus, run.run_id, &run.owner);
        alert
            .labels
            .insert("status".to_string(), format!("{:?}", run.status).to_uppercase());
        alert.annotations.insert(
            "summary".to_string(),
            format!("Run {} is stuck in {:?} status", run.run_id, run.status),
        );
        if !run.restart_lineage.is_empty() {
            let lineage: Vec<String> = run.restart_lineage.iter().map(|id| id.to_string()).collect();
            alert
                .annotations
                .insert("restart_lineage".to_string(), lineage.join(","));
        }
        alert
    }

    async fn send(&self, alerts: Vec<AlertmanagerAlert>) -> Result<()> {
        if alerts.is_empty() {
            return Ok(());
        }
        let count = alerts.len();
        let payload = AlertmanagerPayload { alerts };

        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .context("Failed to send notification batch")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Webhook error ({}): {}", status, body);
        }

        debug!(alerts = count, "Notification batch delivered");
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify_idle(&self, batch: &[IdleNotice], kind: NotificationKind) -> Result<()> {
        let alerts = batch.iter().map(|n| self.idle_alert(n, kind)).collect();
        self.send(alerts).await
    }

    async fn notify_pressure(
        &self,
        batch: &[PressureNotice],
        kind: NotificationKind,
    ) -> Result<()> {
        let alerts = batch.iter().map(|n| self.pressure_alert(n, kind)).collect();
        self.send(alerts).await
    }

    async fn notify_stuck_transitions(&self, batch: &[Workload]) -> Result<()> {
        let alerts = batch.iter().map(|r| self.stuck_alert(r)).collect();
        self.send(alerts).await
    }
}
