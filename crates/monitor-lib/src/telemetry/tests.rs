use super::*;
use crate::models::{GpuUsage, NetworkUsage};
use chrono::TimeZone;
use std::collections::HashMap;
use std::sync::Mutex;

struct StaticRegistry {
    address: Option<String>,
    created: Option<DateTime<Utc>>,
}

#[async_trait]
impl NodeRegistry for StaticRegistry {
    async fn resolve_internal_address(&self, _node_name: &str) -> Result<Option<String>> {
        Ok(self.address.clone())
    }

    async fn creation_timestamp(&self, _node_name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.created)
    }

    async fn container_id(&self, _pod_id: &str, _image: &str) -> Result<String> {
        Ok("abc123".to_string())
    }
}

fn registry(address: Option<&str>) -> Arc<dyn NodeRegistry> {
    Arc::new(StaticRegistry {
        address: address.map(str::to_string),
        created: None,
    })
}

fn at(minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, second).unwrap()
}

// -- per-node agent --

fn agent_backend(server: &mockito::Server) -> AgentTelemetryBackend {
    let port = server
        .host_with_port()
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap();
    AgentTelemetryBackend::new(
        registry(Some("127.0.0.1")),
        port,
        std::time::Duration::from_secs(5),
    )
    .unwrap()
}

const NODE_PAYLOAD: &str = r#"{
    "spec": {
        "has_cpu": true, "has_memory": true, "has_filesystem": true, "has_network": true,
        "cpu": {"mask": "0-3"}, "memory": {"limit": 1000}
    },
    "stats": [
        {
            "timestamp": "2024-01-01T00:00:10Z",
            "cpu": {"usage": {"total": 25000000000}},
            "memory": {"usage": 600},
            "filesystem": [{"device": "/dev/sda1", "capacity": 100, "usage": 70}],
            "network": {"interfaces": [{"name": "eth0", "rx_bytes": 3000, "tx_bytes": 1000}]}
        },
        {
            "timestamp": "2024-01-01T00:00:00Z",
            "cpu": {"usage": {"total": 5000000000}},
            "memory": {"usage": 500},
            "filesystem": [{"device": "/dev/sda1", "capacity": 100, "usage": 60}],
            "network": {"interfaces": [{"name": "eth0", "rx_bytes": 1000, "tx_bytes": 0}]}
        }
    ]
}"#;

#[tokio::test]
async fn test_agent_fetch_builds_rates_from_counters() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v1.3/containers/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(NODE_PAYLOAD)
        .create_async()
        .await;

    let records = agent_backend(&server)
        .fetch("node-1", at(0, 0), at(1, 0), None)
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(records.len(), 1);

    let record = &records[0];
    assert_eq!(record.window_start, at(0, 0));
    assert_eq!(record.window_millis, 10_000);
    // 20s of CPU time over a 10s window
    assert!((record.cpu.unwrap() - 2.0).abs() < 1e-9);
    assert_eq!(record.memory.unwrap().used_bytes, 500);
    assert_eq!(record.disks.as_ref().unwrap()["/dev/sda1"].usable_bytes, 40);

    let eth0 = record.network.as_ref().unwrap()["eth0"];
    assert!((eth0.rx_bytes_per_sec - 200.0).abs() < 1e-9);
    assert!((eth0.tx_bytes_per_sec - 100.0).abs() < 1e-9);

    let spec = record.container_spec.unwrap();
    assert_eq!(spec.core_count, 4);
    assert_eq!(spec.max_memory_bytes, 1000);
}

#[tokio::test]
async fn test_agent_fetch_without_address_is_empty() {
    let backend = AgentTelemetryBackend::new(
        registry(None),
        4194,
        std::time::Duration::from_secs(1),
    )
    .unwrap();

    let records = backend.fetch("pending-node", at(0, 0), at(1, 0), None).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_agent_server_error_is_transport() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/api/v1.3/containers/")
        .with_status(500)
        .create_async()
        .await;

    let err = agent_backend(&server)
        .fetch("node-1", at(0, 0), at(1, 0), None)
        .await
        .unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_agent_available_disk_sums_usable_space() {
    let mut server = mockito::Server::new_async().await;
    let body = r#"{"/docker/abc123": {
        "spec": {"has_filesystem": true},
        "stats": [
            {"timestamp": "2024-01-01T00:00:00Z",
             "filesystem": [{"device": "a", "capacity": 100, "usage": 90}]},
            {"timestamp": "2024-01-01T00:00:05Z",
             "filesystem": [{"device": "a", "capacity": 100, "usage": 50},
                            {"device": "b", "capacity": 200, "usage": 100}]},
            {"timestamp": "2024-01-01T00:00:10Z",
             "filesystem": []}
        ]
    }}"#;
    let _mock = server
        .mock("GET", "/api/v1.3/docker/abc123")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await;

    let free = agent_backend(&server)
        .available_disk_bytes("node-1", "pod-1", "image:latest")
        .await
        .unwrap();
    assert_eq!(free, 150);
}

#[tokio::test]
async fn test_agent_available_disk_without_data_is_unavailable() {
    let mut server = mockito::Server::new_async().await;
    let body = r#"{"/docker/abc123": {"spec": {"has_filesystem": true}, "stats": []}}"#;
    let _mock = server
        .mock("GET", "/api/v1.3/docker/abc123")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await;

    let err = agent_backend(&server)
        .available_disk_bytes("node-1", "pod-1", "image:latest")
        .await
        .unwrap_err();
    assert!(matches!(err, TelemetryError::Unavailable { .. }));
}

fn sample(ts: DateTime<Utc>, cpu_total: u64, interfaces: &[(&str, u64)]) -> AgentSample {
    let ifaces: Vec<serde_json::Value> = interfaces
        .iter()
        .map(|(name, rx)| serde_json::json!({"name": name, "rx_bytes": rx, "tx_bytes": 0}))
        .collect();
    serde_json::from_value(serde_json::json!({
        "timestamp": ts,
        "cpu": {"usage": {"total": cpu_total}},
        "network": {"interfaces": ifaces}
    }))
    .unwrap()
}

fn cpu_and_network_spec() -> AgentSpec {
    serde_json::from_str(r#"{"has_cpu": true, "has_network": true}"#).unwrap()
}

#[test]
fn test_counter_reset_leaves_window_without_load() {
    let samples = vec![
        sample(at(0, 0), 0, &[("eth0", 100), ("eth1", 100)]),
        sample(at(0, 10), 10_000_000_000, &[("eth0", 600), ("eth1", 300)]),
        sample(at(0, 20), 5_000_000, &[("eth0", 50), ("eth1", 400)]),
    ];
    let records =
        AgentTelemetryBackend::build_records("node-1", &cpu_and_network_spec(), samples).unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].cpu, Some(1.0));
    assert!(records[1].cpu.is_none());

    let network = records[1].network.as_ref().unwrap();
    assert!(!network.contains_key("eth0"));
    assert_eq!(network["eth1"].rx_bytes_per_sec, 10.0);

    let busy: Vec<f64> = records.iter().filter_map(|r| r.cpu).collect();
    assert_eq!(busy, vec![1.0]);
}

#[test]
fn test_missing_interface_is_inconsistent() {
    let samples = vec![
        sample(at(0, 0), 0, &[("eth0", 0), ("eth1", 0)]),
        sample(at(0, 10), 0, &[("eth0", 10)]),
    ];
    let err = AgentTelemetryBackend::build_records("node-1", &cpu_and_network_spec(), samples)
        .unwrap_err();
    assert!(matches!(err, TelemetryError::Inconsistent { .. }));
}

#[test]
fn test_sub_second_pairs_are_skipped() {
    let ms = |millis: i64| at(0, 0) + Duration::milliseconds(millis);
    let samples = vec![
        sample(ms(0), 0, &[]),
        sample(ms(400), 0, &[]),
        sample(ms(2_400), 0, &[]),
    ];
    let records =
        AgentTelemetryBackend::build_records("node-1", &cpu_and_network_spec(), samples).unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].window_millis, 2_000);
}

// -- time-series store --

#[derive(Default)]
struct FakeStore {
    buckets: HashMap<MetricFamily, Vec<SeriesBucket>>,
    oldest: Option<DateTime<Utc>>,
    queries: Mutex<Vec<SeriesQuery>>,
}

impl FakeStore {
    fn with(mut self, family: MetricFamily, buckets: Vec<SeriesBucket>) -> Self {
        self.buckets.insert(family, buckets);
        self
    }
}

#[async_trait]
impl TimeSeriesStore for FakeStore {
    async fn query(&self, query: &SeriesQuery) -> std::result::Result<Vec<SeriesBucket>, TelemetryError> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(self.buckets.get(&query.family).cloned().unwrap_or_default())
    }

    async fn oldest_available(&self) -> std::result::Result<Option<DateTime<Utc>>, TelemetryError> {
        Ok(self.oldest)
    }
}

fn bucket(ts: DateTime<Utc>, value: BucketValue) -> SeriesBucket {
    SeriesBucket {
        timestamp: ts,
        value,
    }
}

fn disks(entries: &[(&str, u64, u64)]) -> BucketValue {
    BucketValue::Filesystem {
        disks: entries
            .iter()
            .map(|(device, capacity, used)| {
                (
                    device.to_string(),
                    DiskSample {
                        capacity_bytes: *capacity,
                        used_bytes: *used,
                    },
                )
            })
            .collect(),
    }
}

fn interfaces() -> BucketValue {
    let mut interfaces = HashMap::new();
    interfaces.insert(
        "eth0".to_string(),
        NetworkUsage {
            rx_bytes_per_sec: 10.0,
            tx_bytes_per_sec: 5.0,
        },
    );
    BucketValue::Network { interfaces }
}

fn full_store(timestamps: &[DateTime<Utc>]) -> FakeStore {
    let each = |value: BucketValue| {
        timestamps
            .iter()
            .map(|ts| bucket(*ts, value.clone()))
            .collect::<Vec<_>>()
    };
    FakeStore {
        oldest: Some(at(0, 0)),
        ..FakeStore::default()
    }
    .with(MetricFamily::Cpu, each(BucketValue::Cpu { load: 0.5 }))
    .with(
        MetricFamily::Memory,
        each(BucketValue::Memory {
            capacity_bytes: 1000,
            used_bytes: 250,
        }),
    )
    .with(MetricFamily::Filesystem, each(disks(&[("sda", 100, 20)])))
    .with(MetricFamily::Network, each(interfaces()))
}

fn series_backend(store: FakeStore) -> SeriesTelemetryBackend {
    SeriesTelemetryBackend::new(
        Arc::new(store),
        registry(None),
        SeriesSettings {
            desired_bucket_count: 4,
            min_interval: Duration::minutes(1),
            fallback_window: Duration::hours(1),
        },
    )
}

#[tokio::test]
async fn test_series_fetch_merges_families() {
    let backend = series_backend(full_store(&[at(0, 0), at(1, 0), at(2, 0)]));

    let records = backend
        .fetch("node-1", at(0, 0), at(3, 0), Some(Duration::minutes(1)))
        .await
        .unwrap();

    assert_eq!(records.len(), 3);
    for record in &records {
        assert!(record.is_complete());
        assert_eq!(record.cpu, Some(0.5));
        // gpu-less node still yields complete records
        assert_eq!(record.gpu, Some(GpuUsage::default()));
    }
    assert!(records.windows(2).all(|w| w[0].window_start < w[1].window_start));
    assert_eq!(records[0].disks.as_ref().unwrap()["sda"].usable_bytes, 80);
}

#[tokio::test]
async fn test_series_fetch_drops_incomplete_windows() {
    let store = full_store(&[at(0, 0), at(1, 0)]).with(
        MetricFamily::Cpu,
        vec![bucket(at(0, 0), BucketValue::Cpu { load: 0.1 })],
    );
    let backend = series_backend(store);

    let records = backend
        .fetch("node-1", at(0, 0), at(2, 0), Some(Duration::minutes(1)))
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].window_start, at(0, 0));
}

#[tokio::test]
async fn test_series_fetch_clips_to_requested_range() {
    let backend = series_backend(full_store(&[at(0, 0), at(1, 0), at(2, 0)]));

    let records = backend
        .fetch("node-1", at(0, 30), at(2, 15), Some(Duration::minutes(1)))
        .await
        .unwrap();

    let windows: Vec<_> = records.iter().map(|r| (r.window_start, r.window_end)).collect();
    assert_eq!(
        windows,
        vec![
            (at(0, 30), at(1, 0)),
            (at(1, 0), at(2, 0)),
            (at(2, 0), at(2, 15)),
        ]
    );
}

#[tokio::test]
async fn test_series_fetch_before_retention_is_empty() {
    let mut store = full_store(&[at(0, 0)]);
    store.oldest = Some(at(30, 0));
    let backend = series_backend(store);

    let records = backend.fetch("node-1", at(0, 0), at(10, 0), None).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_series_fetch_uses_adaptive_interval() {
    let store = Arc::new(full_store(&[]));
    let backend = SeriesTelemetryBackend::new(
        store.clone(),
        registry(None),
        SeriesSettings {
            desired_bucket_count: 4,
            min_interval: Duration::minutes(1),
            fallback_window: Duration::hours(1),
        },
    );

    backend.fetch("node-1", at(0, 0), at(30, 0), None).await.unwrap();

    let queries = store.queries.lock().unwrap();
    assert_eq!(queries.len(), MetricFamily::ALL.len());
    assert!(queries.iter().all(|q| q.interval_ms == 10 * 60 * 1000));
}

#[tokio::test]
async fn test_series_start_falls_back_to_node_creation() {
    let store = Arc::new(FakeStore::default());
    let backend = SeriesTelemetryBackend::new(
        store.clone(),
        Arc::new(StaticRegistry {
            address: None,
            created: Some(at(20, 0)),
        }),
        SeriesSettings::default(),
    );

    backend.fetch("node-1", at(0, 0), at(30, 0), None).await.unwrap();

    let queries = store.queries.lock().unwrap();
    assert!(queries.iter().all(|q| q.start == at(20, 0)));
}

#[tokio::test]
async fn test_series_available_disk_excludes_pseudo_tiers() {
    let now = Utc::now();
    let store = FakeStore::default().with(
        MetricFamily::Filesystem,
        vec![
            bucket(now - Duration::minutes(2), disks(&[("sda", 100, 10)])),
            bucket(
                now - Duration::minutes(1),
                disks(&[("sda", 100, 40), ("sdb", 50, 10), ("tmpfs", 1000, 0), ("swap", 500, 0)]),
            ),
        ],
    );
    let backend = series_backend(store);

    let free = backend
        .available_disk_bytes("node-1", "pod-1", "image")
        .await
        .unwrap();
    assert_eq!(free, 100);
}

#[tokio::test]
async fn test_series_available_disk_without_data_is_unavailable() {
    let backend = series_backend(FakeStore::default());

    let err = backend
        .available_disk_bytes("node-1", "pod-1", "image")
        .await
        .unwrap_err();
    assert!(matches!(err, TelemetryError::Unavailable { .. }));
}

#[test]
fn test_merge_keeps_first_value_and_unions_disks() {
    let mut first = UsageRecord::new(at(0, 0), at(1, 0)).unwrap();
    first.cpu = Some(0.2);
    first.disks = Some(
        [("sda".to_string(), crate::models::DiskUsage { capacity_bytes: 10, usable_bytes: 5 })]
            .into_iter()
            .collect(),
    );

    let mut second = UsageRecord::new(at(0, 0), at(1, 0)).unwrap();
    second.cpu = Some(0.9);
    second.memory = Some(crate::models::MemoryUsage {
        capacity_bytes: 10,
        used_bytes: 1,
    });
    second.disks = Some(
        [("sdb".to_string(), crate::models::DiskUsage { capacity_bytes: 20, usable_bytes: 15 })]
            .into_iter()
            .collect(),
    );

    let other = UsageRecord::new(at(1, 0), at(2, 0)).unwrap();

    let merged = merge_records(vec![other, first, second]);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].cpu, Some(0.2));
    assert!(merged[0].memory.is_some());
    assert_eq!(merged[0].disks.as_ref().unwrap().len(), 2);
    assert_eq!(merged[1].window_start, at(1, 0));
}

#[test]
fn test_clip_drops_records_outside_range() {
    let records = vec![
        UsageRecord::new(at(0, 0), at(1, 0)).unwrap(),
        UsageRecord::new(at(5, 0), at(6, 0)).unwrap(),
    ];
    let clipped = clip_records(records, Duration::minutes(1), at(1, 0), at(3, 0));
    assert!(clipped.is_empty());
}
