//! Time-series store telemetry backend
//!
//! Each metric family is queried separately over an adaptive interval. The
//! per-family buckets are joined on window start, incomplete windows are
//! dropped and the survivors are clipped to the requested region.

use super::store::{BucketValue, MetricFamily, SeriesBucket, SeriesQuery, TimeSeriesStore};
use super::{TelemetryBackend, MIN_WINDOW_MILLIS};
use crate::error::TelemetryError;
use crate::models::{DiskUsage, GpuUsage, MemoryUsage, UsageRecord};
use crate::platform::NodeRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Filesystem tiers that never count towards run disk usage
const PSEUDO_FILESYSTEMS: &[&str] = &["tmpfs", "swap"];

/// Tuning for interval sizing and start resolution
#[derive(Debug, Clone)]
pub struct SeriesSettings {
    /// Number of buckets aimed for when no interval is requested
    pub desired_bucket_count: u32,
    /// Never query with a finer interval than this
    pub min_interval: Duration,
    /// Look-back used when no oldest date is known
    pub fallback_window: Duration,
}

impl Default for SeriesSettings {
    fn default() -> Self {
        Self {
            desired_bucket_count: 10,
            min_interval: Duration::minutes(1),
            fallback_window: Duration::hours(24),
        }
    }
}

/// Bucket width for a query over `[start, end]`
pub fn adaptive_interval(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    requested: Option<Duration>,
    settings: &SeriesSettings,
) -> Duration {
    let interval = requested.unwrap_or_else(|| {
        let divisor = settings.desired_bucket_count.saturating_sub(1).max(1) as i32;
        (end - start) / divisor
    });
    interval.max(settings.min_interval)
}

fn bucket_to_record(bucket: SeriesBucket, interval: Duration) -> Option<UsageRecord> {
    let mut record = UsageRecord::new(bucket.timestamp, bucket.timestamp + interval)?;
    match bucket.value {
        BucketValue::Cpu { load } => record.cpu = Some(load),
        BucketValue::Memory {
            capacity_bytes,
            used_bytes,
        } => {
            record.memory = Some(MemoryUsage {
                capacity_bytes,
                used_bytes,
            })
        }
        BucketValue::Filesystem { disks } => {
            record.disks = Some(
                disks
                    .into_iter()
                    .map(|(device, d)| {
                        (
                            device,
                            DiskUsage {
                                capacity_bytes: d.capacity_bytes,
                                usable_bytes: d.capacity_bytes.saturating_sub(d.used_bytes),
                            },
                        )
                    })
                    .collect(),
            )
        }
        BucketValue::Network { interfaces } => record.network = Some(interfaces),
        BucketValue::Gpu(gpu) => record.gpu = Some(gpu),
    }
    Some(record)
}

/// Fold `other` into `target`: first value wins per field, disk maps are unioned
fn merge_into(target: &mut UsageRecord, other: UsageRecord) {
    target.cpu = target.cpu.or(other.cpu);
    target.memory = target.memory.or(other.memory);
    target.network = target.network.take().or(other.network);
    target.gpu = target.gpu.or(other.gpu);
    target.container_spec = target.container_spec.or(other.container_spec);

    if let Some(disks) = other.disks {
        target.disks.get_or_insert_with(HashMap::new).extend(disks);
    }
}

/// Join records sharing a window start, ordered by window start
pub fn merge_records(records: Vec<UsageRecord>) -> Vec<UsageRecord> {
    let mut grouped: BTreeMap<DateTime<Utc>, UsageRecord> = BTreeMap::new();
    for record in records {
        match grouped.entry(record.window_start) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => merge_into(slot.get_mut(), record),
        }
    }
    grouped.into_values().collect()
}

/// Intersect each `[window_start, window_start + interval]` with `[start, end]`
pub fn clip_records(
    records: Vec<UsageRecord>,
    interval: Duration,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<UsageRecord> {
    records
        .into_iter()
        .filter_map(|record| {
            let clipped_start = record.window_start.max(start);
            let clipped_end = (record.window_start + interval).min(end);
            record
                .with_window(clipped_start, clipped_end)
                .filter(|r| r.window_millis >= MIN_WINDOW_MILLIS)
        })
        .collect()
}

fn is_pseudo_filesystem(device: &str) -> bool {
    let device = device.to_ascii_lowercase();
    PSEUDO_FILESYSTEMS.iter().any(|p| device.contains(p))
}

/// Telemetry backend over a time-series store
pub struct SeriesTelemetryBackend {
    store: Arc<dyn TimeSeriesStore>,
    registry: Arc<dyn NodeRegistry>,
    settings: SeriesSettings,
}

impl SeriesTelemetryBackend {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        registry: Arc<dyn NodeRegistry>,
        settings: SeriesSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    /// Oldest date data can exist for: store retention, then node creation, then fallback
    async fn resolve_oldest(&self, node: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.store.oldest_available().await {
            Ok(Some(oldest)) => return oldest,
            Ok(None) => {}
            Err(e) => warn!(node = %node, error = %e, "Failed to read oldest index date"),
        }

        match self.registry.creation_timestamp(node).await {
            Ok(Some(created)) => return created,
            Ok(None) => {}
            Err(e) => debug!(node = %node, error = %e, "Failed to read node creation time"),
        }

        now - self.settings.fallback_window
    }

    async fn query_family(
        &self,
        node: &str,
        pod: Option<&str>,
        family: MetricFamily,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
    ) -> Result<Vec<SeriesBucket>, TelemetryError> {
        let query = SeriesQuery {
            family,
            node: node.to_string(),
            pod: pod.map(str::to_string),
            start,
            end,
            interval_ms: interval.num_milliseconds(),
        };
        self.store.query(&query).await
    }
}

#[async_trait]
impl TelemetryBackend for SeriesTelemetryBackend {
    async fn fetch(
        &self,
        node: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: Option<Duration>,
    ) -> Result<Vec<UsageRecord>, TelemetryError> {
        let oldest = self.resolve_oldest(node, Utc::now()).await;
        let start = from.max(oldest);
        let end = to;
        if end <= start || end <= oldest {
            debug!(node = %node, "Requested range precedes available data");
            return Ok(Vec::new());
        }

        let interval = adaptive_interval(start, end, interval, &self.settings);

        let (cpu, memory, filesystem, network, gpu) = tokio::join!(
            self.query_family(node, None, MetricFamily::Cpu, start, end, interval),
            self.query_family(node, None, MetricFamily::Memory, start, end, interval),
            self.query_family(node, None, MetricFamily::Filesystem, start, end, interval),
            self.query_family(node, None, MetricFamily::Network, start, end, interval),
            self.query_family(node, None, MetricFamily::Gpu, start, end, interval),
        );

        let gpu = gpu?;
        let gpu_less = gpu.is_empty();

        let records: Vec<UsageRecord> = [cpu?, memory?, filesystem?, network?, gpu]
            .into_iter()
            .flatten()
            .filter_map(|bucket| bucket_to_record(bucket, interval))
            .collect();

        let mut merged = merge_records(records);
        if gpu_less {
            for record in &mut merged {
                record.gpu.get_or_insert_with(GpuUsage::default);
            }
        }

        let complete: Vec<UsageRecord> = merged.into_iter().filter(|r| r.is_complete()).collect();

        let mut clipped = clip_records(complete, interval, start, end);
        clipped.sort_by_key(|r| r.window_start);
        Ok(clipped)
    }

    async fn available_disk_bytes(
        &self,
        node: &str,
        pod_id: &str,
        _image: &str,
    ) -> Result<u64, TelemetryError> {
        let end = Utc::now();
        let interval = adaptive_interval(end - self.settings.min_interval, end, None, &self.settings);
        let start = end - interval * 2;

        let buckets = self
            .query_family(node, Some(pod_id), MetricFamily::Filesystem, start, end, interval)
            .await?;

        let mut totals: BTreeMap<DateTime<Utc>, (u64, u64)> = BTreeMap::new();
        for bucket in buckets {
            if let BucketValue::Filesystem { disks } = bucket.value {
                for (device, sample) in disks {
                    if is_pseudo_filesystem(&device) {
                        continue;
                    }
                    let total = totals.entry(bucket.timestamp).or_insert((0, 0));
                    total.0 += sample.capacity_bytes;
                    total.1 += sample.used_bytes;
                }
            }
        }

        let (_, (capacity, used)) = totals
            .into_iter()
            .next_back()
            .ok_or_else(|| TelemetryError::unavailable(pod_id, "no filesystem buckets"))?;
        Ok(capacity.saturating_sub(used))
    }
}
