use super::*;
use crate::core::config::MetricsConfig;
use crate::core::{CallStack, Location, MemoryUsage, StackFrame};
use crate::metrics::Dispatcher;
use crate::storage::{DataLoader, MetadataStorage, SqliteMetadataStorage};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Counters {
    savers: AtomicUsize,
    saves: AtomicUsize,
    closes: AtomicUsize,
}

/// Storage that records calls and can be told to fail saves.
struct CountingStorage {
    metadata: Arc<SqliteMetadataStorage>,
    counters: Arc<Counters>,
    fail_saves: bool,
}

struct CountingSaver {
    session: SessionDescription,
    counters: Arc<Counters>,
    fail_saves: bool,
}

#[async_trait]
impl Storage for CountingStorage {
    async fn new_data_saver(&self, instance: &InstanceDescription) -> Result<Box<dyn DataSaver>> {
        let session = self.metadata.start_session(instance).await?;
        self.counters.savers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingSaver {
            session,
            counters: Arc::clone(&self.counters),
            fail_saves: self.fail_saves,
        }))
    }

    async fn new_data_loader(&self, session: &SessionDescription) -> Result<Box<dyn DataLoader>> {
        Err(HeapwatchError::not_found(session.key()))
    }

    fn metadata(&self) -> Arc<dyn MetadataStorage> {
        self.metadata.clone()
    }

    async fn quit(&self) {}
}

#[async_trait]
impl DataSaver for CountingSaver {
    fn session(&self) -> &SessionDescription {
        &self.session
    }

    async fn save(&mut self, _measurement: &Measurement) -> Result<()> {
        if self.fail_saves {
            return Err(HeapwatchError::storage("disk full"));
        }
        self.counters.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    protocol: SaveProtocol,
    metrics: Arc<MetricsService>,
    counters: Arc<Counters>,
}

fn harness(fail_saves: bool) -> Harness {
    let counters = Arc::new(Counters::default());
    let storage: Arc<dyn Storage> = Arc::new(CountingStorage {
        metadata: Arc::new(SqliteMetadataStorage::open_in_memory().unwrap()),
        counters: Arc::clone(&counters),
        fail_saves,
    });
    let metrics = Arc::new(MetricsService::new(
        Arc::clone(&storage),
        Dispatcher::new(4),
        &MetricsConfig::default(),
        None,
    ));
    Harness {
        protocol: SaveProtocol::new(storage, Arc::clone(&metrics)),
        metrics,
        counters,
    }
}

fn instance() -> InstanceDescription {
    InstanceDescription::new("checkout", "checkout-7f9c").unwrap()
}

fn measurement(step: i64) -> Measurement {
    Measurement {
        observed_at: Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap() + Duration::seconds(step),
        locations: vec![Location {
            call_stack: CallStack::new(vec![StackFrame::new("cart.Add", "cart.go", 41)]),
            memory_usage: MemoryUsage {
                alloc_objects: step * 2,
                alloc_bytes: step * 512,
                free_objects: step,
                free_bytes: step * 256,
            },
        }],
    }
}

#[tokio::test]
async fn test_normal_flow() {
    let mut h = harness(false);

    let session = h.protocol.add_description(&instance()).await.unwrap();
    assert_eq!(h.protocol.state_name(), "await_measurement");
    assert_eq!(h.protocol.session(), Some(&session));

    for step in 0..3 {
        h.protocol.add_measurement(&measurement(step)).await.unwrap();
    }
    h.protocol.close().await.unwrap();

    assert_eq!(h.protocol.state_name(), "finished");
    assert_eq!(h.protocol.measurement_count(), 3);
    assert_eq!(h.counters.saves.load(Ordering::SeqCst), 3);
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);

    let metrics = h
        .metrics
        .get_session_metrics(&CancellationToken::new(), &session)
        .await
        .unwrap();
    assert!((metrics.locations[0].rates.in_use_bytes_rate - 256.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_measurement_before_description() {
    let mut h = harness(false);

    let err = h.protocol.add_measurement(&measurement(0)).await.unwrap_err();
    assert!(matches!(
        err,
        HeapwatchError::Protocol(ProtocolError::UnexpectedCall {
            method: "add_measurement",
            state: "await_description",
        })
    ));
    assert_eq!(h.protocol.state_name(), "finished");
    assert_eq!(h.counters.savers.load(Ordering::SeqCst), 0);
    assert_eq!(h.counters.saves.load(Ordering::SeqCst), 0);
    assert_eq!(h.metrics.resident_count(), 0);

    // Nothing more is accepted afterwards.
    assert!(h.protocol.add_description(&instance()).await.is_err());
    assert_eq!(h.counters.savers.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_second_description_releases_saver() {
    let mut h = harness(false);

    h.protocol.add_description(&instance()).await.unwrap();
    let err = h.protocol.add_description(&instance()).await.unwrap_err();
    assert!(matches!(
        err,
        HeapwatchError::Protocol(ProtocolError::UnexpectedCall {
            method: "add_description",
            state: "await_measurement",
        })
    ));
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);

    h.protocol.close().await.unwrap();
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let mut h = harness(false);
    h.protocol.add_description(&instance()).await.unwrap();

    h.protocol.close().await.unwrap();
    h.protocol.close().await.unwrap();
    h.protocol.close().await.unwrap();

    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_without_description() {
    let mut h = harness(false);
    h.protocol.close().await.unwrap();
    assert_eq!(h.protocol.state_name(), "finished");
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_save_skips_metrics() {
    let mut h = harness(true);
    let session = h.protocol.add_description(&instance()).await.unwrap();

    let err = h.protocol.add_measurement(&measurement(0)).await.unwrap_err();
    assert_eq!(err.category(), "storage");
    assert!(!h.metrics.is_resident(&session));

    // The stream is torn down by closing, which still releases the saver.
    h.protocol.close().await.unwrap();
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_description_acquires_nothing() {
    let mut h = harness(false);
    let bad = InstanceDescription {
        service_name: String::new(),
        instance_name: "x".to_string(),
    };

    assert!(h.protocol.add_description(&bad).await.is_err());
    assert_eq!(h.counters.savers.load(Ordering::SeqCst), 0);
    assert_eq!(h.protocol.state_name(), "finished");
}

#[tokio::test]
async fn test_dropped_protocol_releases_saver() {
    let h = harness(false);
    let mut protocol = h.protocol;
    protocol.add_description(&instance()).await.unwrap();
    drop(protocol);

    for _ in 0..50 {
        if h.counters.closes.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_save_request_wire_format() {
    let line = r#"{"description":{"service_name":"checkout","instance_name":"checkout-7f9c"}}"#;
    let request: SaveRequest = serde_json::from_str(line).unwrap();
    assert_eq!(request, SaveRequest::Description(instance()));
}
