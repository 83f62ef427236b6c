use chrono::{TimeZone, Utc};
use pulse::config::TelemetryConfig;
use pulse::payload;
use pulse::policy::PolicyRegistry;
use pulse::store::{EncryptedStore, MemoryBackend, StorageBackend};
use pulse::telemetry::{FlushOutcome, KpiMetric, RecordingTransport, TelemetryClient, TelemetryError, TrackRequest};
use pulse::time::ManualClock;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Memory backend whose writes can be switched off.
#[derive(Clone, Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    failing: Arc<AtomicBool>,
}

impl StorageBackend for FlakyBackend {
    fn load(&self, slot: &str) -> io::Result<Option<String>> {
        self.inner.load(slot)
    }

    fn save(&self, slot: &str, value: &str) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.inner.save(slot, value)
    }

    fn delete(&self, slot: &str) -> io::Result<()> {
        self.inner.delete(slot)
    }

    fn is_durable(&self) -> bool {
        false
    }
}

fn config() -> TelemetryConfig {
    TelemetryConfig {
        max_queue_size: 50,
        flush_batch_size: 10,
        flush_interval_ms: 1_000,
        max_retries: 2,
        ..TelemetryConfig::default()
    }
}

fn client_with(
    config: TelemetryConfig,
    transport: RecordingTransport,
    store: Arc<EncryptedStore>,
    online: bool,
) -> TelemetryClient<RecordingTransport> {
    let policies = Arc::new(PolicyRegistry::new(store.clone()));
    policies.ensure_seeded().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 0).unwrap()));
    TelemetryClient::builder(config, store, policies, transport)
        .clock(clock)
        .online(online)
        .build()
}

fn client(online: bool) -> TelemetryClient<RecordingTransport> {
    client_with(config(), RecordingTransport::new(), Arc::new(EncryptedStore::in_memory()), online)
}

fn price_query(commodity: &str) -> TrackRequest {
    TrackRequest::new(
        "POL_MARKET_PRICING",
        "PRICE_QUERY",
        payload! { "commodity" => commodity, "district" => "Nashik", "queryCount" => 1 },
    )
}

#[tokio::test]
async fn valid_event_is_queued_with_metadata() {
    let client = client(false);
    let event = client.track(price_query("onion").with_service(12)).unwrap();

    assert_eq!(event.policy_id.as_deref(), Some("POL_MARKET_PRICING"));
    assert_eq!(event.service_id, Some(12));
    assert_eq!(event.retries, 0);
    assert_eq!(event.occurred_at, Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 0).unwrap());
    assert_eq!(client.queue_len(), 1);
    assert_eq!(client.queued_events()[0].id, event.id);
}

#[tokio::test]
async fn policy_violation_is_rejected_and_nothing_is_queued() {
    let client = client(true);
    client.track(price_query("tomato")).unwrap();

    let err = client
        .track(TrackRequest::new(
            "POL_MARKET_PRICING",
            "PRICE_QUERY",
            payload! { "commodity" => "onion", "district" => "Nashik" },
        ))
        .unwrap_err();

    match err {
        TelemetryError::PolicyViolation { policy_id, event_id, errors } => {
            assert_eq!(policy_id, "POL_MARKET_PRICING");
            assert_eq!(event_id, "PRICE_QUERY");
            assert!(errors.iter().any(|e| e.contains("queryCount")));
        }
        other => panic!("expected policy violation, got {other:?}"),
    }
    assert_eq!(client.queue_len(), 1);

    assert!(client.track(TrackRequest::new("POL_UNKNOWN", "PRICE_QUERY", payload! {})).is_err());
    assert_eq!(client.queue_len(), 1);
}

fn price_alert() -> TrackRequest {
    TrackRequest::new(
        "POL_MARKET_PRICING",
        "PRICE_ALERT_SET",
        payload! { "commodity" => "onion", "district" => "Nashik", "thresholdPrice" => 2400 },
    )
}

fn roomy_config() -> TelemetryConfig {
    TelemetryConfig { max_queue_size: 500, ..config() }
}

#[tokio::test]
async fn velocity_ceiling_is_counted_but_never_blocks() {
    let client = client_with(roomy_config(), RecordingTransport::new(), Arc::new(EncryptedStore::in_memory()), false);

    // PRICE_ALERT_SET allows 60 per hour.
    for _ in 0..60 {
        client.track(price_alert()).unwrap();
    }
    assert_eq!(client.velocity_breaches(), 0);

    client.track(price_alert()).unwrap();
    assert_eq!(client.velocity_breaches(), 1);
    assert_eq!(client.queue_len(), 61);
}

#[tokio::test]
async fn velocity_counts_events_already_delivered() {
    let client = client_with(roomy_config(), RecordingTransport::new(), Arc::new(EncryptedStore::in_memory()), true);
    for _ in 0..60 {
        client.track(price_alert()).unwrap();
    }
    while client.flush().await.unwrap() != FlushOutcome::Empty {}
    assert_eq!(client.queue_len(), 0);
    assert_eq!(client.event_log().len(), 60);

    client.track(price_alert()).unwrap();
    assert_eq!(client.velocity_breaches(), 1);
}

#[tokio::test]
async fn delivered_events_stay_in_the_log() {
    let backend = MemoryBackend::new();
    let store = Arc::new(EncryptedStore::with_memory(backend.clone()));
    let client = client_with(config(), RecordingTransport::new(), store, true);
    let first = client.track(price_query("onion")).unwrap();
    assert_eq!(client.flush().await.unwrap(), FlushOutcome::Delivered(1));
    client.notify_offline();
    let second = client.track(price_query("garlic")).unwrap();

    let ids: Vec<String> = client.event_log().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);
    assert_eq!(client.queue_len(), 1);

    // History is persisted alongside the queue.
    let reopened = client_with(
        config(),
        RecordingTransport::new(),
        Arc::new(EncryptedStore::with_memory(backend)),
        false,
    );
    let ids: Vec<String> = reopened.event_log().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

#[tokio::test]
async fn failed_queue_write_records_nothing() {
    let backend = FlakyBackend::default();
    let store = Arc::new(EncryptedStore::new(Box::new(backend.clone())).unwrap());
    let client = client_with(config(), RecordingTransport::new(), store, true);

    backend.failing.store(true, Ordering::SeqCst);
    let err = client.track(price_query("onion")).unwrap_err();
    assert!(matches!(err, TelemetryError::Storage(_)));
    assert_eq!(client.queue_len(), 0);
    assert_eq!(client.flush().await.unwrap(), FlushOutcome::Empty);
    assert_eq!(client.transport().attempts(), 0);
}

#[tokio::test]
async fn offline_flush_is_a_no_op() {
    let client = client(false);
    client.track(price_query("onion")).unwrap();

    assert_eq!(client.flush().await.unwrap(), FlushOutcome::Offline);
    assert_eq!(client.transport().attempts(), 0);
    assert_eq!(client.queue_len(), 1);
}

#[tokio::test]
async fn empty_queue_flush_does_not_call_transport() {
    let client = client(true);
    assert_eq!(client.flush().await.unwrap(), FlushOutcome::Empty);
    assert_eq!(client.transport().attempts(), 0);
}

#[tokio::test]
async fn flush_delivers_oldest_batch_first() {
    let client = client(true);
    for n in 0..12 {
        client.track(price_query(&format!("crop-{n}"))).unwrap();
    }

    assert_eq!(client.flush().await.unwrap(), FlushOutcome::Delivered(10));
    assert_eq!(client.queue_len(), 2);
    assert_eq!(client.flush().await.unwrap(), FlushOutcome::Delivered(2));
    assert_eq!(client.queue_len(), 0);

    let commodities: Vec<String> = client
        .transport()
        .delivered()
        .iter()
        .map(|e| e.text("commodity").unwrap().to_string())
        .collect();
    let expected: Vec<String> = (0..12).map(|n| format!("crop-{n}")).collect();
    assert_eq!(commodities, expected);
}

#[tokio::test]
async fn failing_transport_drops_after_retry_budget() {
    let client = client_with(config(), RecordingTransport::failing(), Arc::new(EncryptedStore::in_memory()), true);
    client.track(price_query("onion")).unwrap();

    // maxRetries = 2: the third failure exhausts the budget.
    for expected_retries in 1..=2 {
        assert_eq!(client.flush().await.unwrap(), FlushOutcome::Failed { retried: 1, dropped: 0 });
        assert_eq!(client.queued_events()[0].retries, expected_retries);
    }
    assert_eq!(client.flush().await.unwrap(), FlushOutcome::Failed { retried: 1, dropped: 1 });
    assert_eq!(client.queue_len(), 0);
    assert_eq!(client.transport().attempts(), 3);
}

#[tokio::test]
async fn recovered_transport_delivers_retried_events() {
    let client = client_with(config(), RecordingTransport::failing(), Arc::new(EncryptedStore::in_memory()), true);
    client.track(price_query("onion")).unwrap();
    client.flush().await.unwrap();

    client.transport().set_failing(false);
    assert_eq!(client.flush().await.unwrap(), FlushOutcome::Delivered(1));
    assert_eq!(client.transport().delivered()[0].retries, 1);
}

#[tokio::test]
async fn reconnect_flushes_immediately() {
    let client = client(false);
    client.track(price_query("onion")).unwrap();

    assert_eq!(client.notify_online().await.unwrap(), Some(FlushOutcome::Delivered(1)));
    // Already online: no second flush.
    assert_eq!(client.notify_online().await.unwrap(), None);

    client.notify_offline();
    assert!(!client.is_online());
}

#[tokio::test]
async fn queue_survives_client_restart() {
    let backend = MemoryBackend::new();
    {
        let store = Arc::new(EncryptedStore::with_memory(backend.clone()));
        let client = client_with(config(), RecordingTransport::new(), store, false);
        client.track(price_query("onion")).unwrap();
        client.track(price_query("garlic")).unwrap();
    }

    let store = Arc::new(EncryptedStore::with_memory(backend));
    let client = client_with(config(), RecordingTransport::new(), store, true);
    assert_eq!(client.queue_len(), 2);
    assert_eq!(client.flush().await.unwrap(), FlushOutcome::Delivered(2));
}

#[tokio::test]
async fn kpi_metric_bypasses_policies() {
    let client = client(false);
    let event = client
        .track_kpi_metric(
            KpiMetric::new("price-alerts", "alert_conversion", 42.5)
                .in_group("treatment")
                .in_district("Nashik")
                .with_service(7),
        )
        .unwrap();

    assert_eq!(event.event_id, "FEATURE_KPI_METRIC");
    assert_eq!(event.policy_id, None);
    assert_eq!(event.service_id, Some(7));
    assert_eq!(event.text("featureId"), Some("price-alerts"));
    assert_eq!(event.number("currentValue"), Some(42.5));
    assert_eq!(event.text("experimentGroupId"), Some("treatment"));

    let goal = client.track_goal_progress("price-alerts", "reduce distress sales", 30.0).unwrap();
    assert_eq!(goal.event_id, "FEATURE_GOAL_PROGRESS");
    assert_eq!(client.queue_len(), 2);
}

#[tokio::test(start_paused = true)]
async fn auto_flush_runs_on_interval_until_destroyed() {
    let client = client(true);
    client.track(price_query("onion")).unwrap();

    client.start_auto_flush();
    assert!(client.is_auto_flushing());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.transport().attempts(), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(client.transport().delivered().len(), 1);

    client.destroy();
    assert!(!client.is_auto_flushing());

    client.track(price_query("garlic")).unwrap();
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(client.queue_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn restarting_auto_flush_replaces_timer() {
    let client = client_with(config(), RecordingTransport::failing(), Arc::new(EncryptedStore::in_memory()), true);
    client.start_auto_flush();
    client.start_auto_flush();
    client.track(price_query("onion")).unwrap();

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    // A failed batch stays queued, so a second live timer would have attempted it again.
    assert_eq!(client.transport().attempts(), 1);
    client.stop_auto_flush();
    assert!(!client.is_auto_flushing());
}

#[tokio::test]
async fn connectivity_signal_drives_flushes() {
    let client = client(false);
    client.track(price_query("onion")).unwrap();

    let (tx, rx) = watch::channel(false);
    client.attach_connectivity(rx);
    tokio::task::yield_now().await;
    assert_eq!(client.queue_len(), 1);

    tx.send(true).unwrap();
    for _ in 0..20 {
        if client.queue_len() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(client.is_online());
    assert_eq!(client.queue_len(), 0);

    tx.send(false).unwrap();
    for _ in 0..20 {
        if !client.is_online() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!client.is_online());
    client.destroy();
}
