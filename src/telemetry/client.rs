use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::{FieldValue, Payload, TelemetryEvent};
use super::queue::{OfflineQueue, QueueSnapshot};
use super::transport::Transport;
use crate::config::TelemetryConfig;
use crate::policy::{validate_against, BusinessPolicy, PolicyRegistry};
use crate::store::{EncryptedStore, StoreError};
use crate::time::{Clock, SystemClock};

/// Event id used by [`TelemetryClient::track_kpi_metric`] unless a KPI names its own.
pub const KPI_METRIC_EVENT: &str = "FEATURE_KPI_METRIC";
pub const GOAL_PROGRESS_EVENT: &str = "FEATURE_GOAL_PROGRESS";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("policy violation for `{policy_id}`/`{event_id}`: {}", .errors.join("; "))]
    PolicyViolation {
        policy_id: String,
        event_id: String,
        errors: Vec<String>,
    },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// A business event to record under a policy.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRequest {
    pub policy_id: String,
    pub event_id: String,
    pub payload: Payload,
    pub service_id: Option<u32>,
}

impl TrackRequest {
    pub fn new(policy_id: impl Into<String>, event_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            policy_id: policy_id.into(),
            event_id: event_id.into(),
            payload,
            service_id: None,
        }
    }

    pub fn with_service(mut self, service_id: u32) -> Self {
        self.service_id = Some(service_id);
        self
    }
}

/// A KPI observation emitted by the feature-governance layer.
#[derive(Debug, Clone, PartialEq)]
pub struct KpiMetric {
    pub event_id: String,
    pub feature_id: String,
    pub kpi_id: String,
    pub current_value: f64,
    pub experiment_group_id: Option<String>,
    pub segment_id: Option<String>,
    pub user_segment: Option<String>,
    pub district: Option<String>,
    pub service_id: Option<u32>,
    pub extra: Payload,
}

impl KpiMetric {
    pub fn new(feature_id: impl Into<String>, kpi_id: impl Into<String>, current_value: f64) -> Self {
        Self {
            event_id: KPI_METRIC_EVENT.to_string(),
            feature_id: feature_id.into(),
            kpi_id: kpi_id.into(),
            current_value,
            experiment_group_id: None,
            segment_id: None,
            user_segment: None,
            district: None,
            service_id: None,
            extra: Payload::new(),
        }
    }

    pub fn measured_by(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.experiment_group_id = Some(group_id.into());
        self
    }

    pub fn in_segment(mut self, segment_id: impl Into<String>) -> Self {
        self.segment_id = Some(segment_id.into());
        self
    }

    pub fn for_user_segment(mut self, user_segment: impl Into<String>) -> Self {
        self.user_segment = Some(user_segment.into());
        self
    }

    pub fn in_district(mut self, district: impl Into<String>) -> Self {
        self.district = Some(district.into());
        self
    }

    pub fn with_service(mut self, service_id: u32) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    fn into_payload(self) -> (String, Payload, Option<u32>) {
        let mut payload = self.extra;
        payload.insert("featureId".into(), self.feature_id.into());
        payload.insert("kpiId".into(), self.kpi_id.into());
        payload.insert("currentValue".into(), self.current_value.into());
        let optional = [
            ("experimentGroupId", self.experiment_group_id),
            ("segmentId", self.segment_id),
            ("userSegment", self.user_segment),
            ("district", self.district),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                payload.insert(name.into(), value.into());
            }
        }
        (self.event_id, payload, self.service_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Offline,
    Empty,
    Delivered(usize),
    Failed { retried: usize, dropped: usize },
}

struct Inner<T> {
    config: TelemetryConfig,
    policies: Arc<PolicyRegistry>,
    queue: Mutex<OfflineQueue>,
    history: Mutex<OfflineQueue>,
    transport: T,
    clock: Arc<dyn Clock>,
    online: AtomicBool,
    velocity_breaches: AtomicU64,
    flush_gate: tokio::sync::Mutex<()>,
    auto_flush: Mutex<Option<CancellationToken>>,
    lifetime: CancellationToken,
}

pub struct TelemetryClientBuilder<T> {
    config: TelemetryConfig,
    store: Arc<EncryptedStore>,
    policies: Arc<PolicyRegistry>,
    transport: T,
    clock: Arc<dyn Clock>,
    online: bool,
}

impl<T: Transport> TelemetryClientBuilder<T> {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Initial connectivity, normally taken from the platform's network signal.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn build(self) -> TelemetryClient<T> {
        let history = OfflineQueue::open(
            Arc::clone(&self.store),
            self.config.history_key.clone(),
            self.config.max_history_size,
        );
        let queue = OfflineQueue::open(self.store, self.config.storage_key.clone(), self.config.max_queue_size);
        TelemetryClient {
            inner: Arc::new(Inner {
                config: self.config,
                policies: self.policies,
                queue: Mutex::new(queue),
                history: Mutex::new(history),
                transport: self.transport,
                clock: self.clock,
                online: AtomicBool::new(self.online),
                velocity_breaches: AtomicU64::new(0),
                flush_gate: tokio::sync::Mutex::new(()),
                auto_flush: Mutex::new(None),
                lifetime: CancellationToken::new(),
            }),
        }
    }
}

/// Policy-gated event recorder with an offline queue and batched delivery.
///
/// Clones share one queue and one connectivity state. Use one client per process.
pub struct TelemetryClient<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TelemetryClient<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Transport> TelemetryClient<T> {
    pub fn builder(
        config: TelemetryConfig,
        store: Arc<EncryptedStore>,
        policies: Arc<PolicyRegistry>,
        transport: T,
    ) -> TelemetryClientBuilder<T> {
        TelemetryClientBuilder {
            config,
            store,
            policies,
            transport,
            clock: Arc::new(SystemClock),
            online: true,
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Validates against the named policy and, only if it passes, queues the event.
    pub fn track(&self, request: TrackRequest) -> Result<TelemetryEvent, TelemetryError> {
        let policy = self.inner.policies.get_policy(&request.policy_id);
        let validation = match &policy {
            Some(policy) => validate_against(policy, &request.event_id, &request.payload),
            None => self
                .inner
                .policies
                .validate_event(&request.policy_id, &request.event_id, &request.payload),
        };

        if !validation.valid {
            warn!(
                policy = %request.policy_id,
                event = %request.event_id,
                errors = ?validation.errors,
                "rejected event that violates policy"
            );
            return Err(TelemetryError::PolicyViolation {
                policy_id: request.policy_id,
                event_id: request.event_id,
                errors: validation.errors,
            });
        }
        for warning in &validation.warnings {
            debug!(%warning, "event carries undeclared field");
        }

        let now = self.inner.clock.now();
        let event = TelemetryEvent::new(request.event_id, request.payload, now)
            .with_policy(request.policy_id)
            .with_service(request.service_id);

        let mut queue = self.queue();
        if let Some(policy) = &policy {
            let history = self.history();
            let breaches = check_velocity(policy, &event, history.iter().chain(queue.iter()), now);
            if breaches > 0 {
                self.inner.velocity_breaches.fetch_add(breaches, Ordering::SeqCst);
            }
        }
        queue.enqueue(event.clone())?;
        debug!(event = %event.event_id, id = %event.id, "event queued");
        Ok(event)
    }

    /// Queues an event without policy validation.
    ///
    /// Reserved for the feature-governance layer (KPI metrics, goal progress).
    /// Business collaborators must go through [`TelemetryClient::track`].
    pub fn track_feature_event(
        &self,
        event_id: impl Into<String>,
        payload: Payload,
        service_id: Option<u32>,
    ) -> Result<TelemetryEvent, TelemetryError> {
        let event = TelemetryEvent::new(event_id, payload, self.inner.clock.now()).with_service(service_id);
        self.queue().enqueue(event.clone())?;
        Ok(event)
    }

    pub fn track_kpi_metric(&self, metric: KpiMetric) -> Result<TelemetryEvent, TelemetryError> {
        let (event_id, payload, service_id) = metric.into_payload();
        self.track_feature_event(event_id, payload, service_id)
    }

    pub fn track_goal_progress(
        &self,
        feature_id: &str,
        goal: &str,
        progress_percent: f64,
    ) -> Result<TelemetryEvent, TelemetryError> {
        let payload = crate::payload! {
            "featureId" => feature_id,
            "goal" => goal,
            "progressPercent" => progress_percent,
        };
        self.track_feature_event(GOAL_PROGRESS_EVENT, payload, None)
    }

    /// Sends one batch. Offline or empty queues are a no-op. Transport failures are
    /// absorbed: retries are counted and events over budget are dropped.
    pub async fn flush(&self) -> Result<FlushOutcome, TelemetryError> {
        if !self.is_online() {
            return Ok(FlushOutcome::Offline);
        }
        let _gate = self.inner.flush_gate.lock().await;
        if !self.is_online() {
            return Ok(FlushOutcome::Offline);
        }

        let batch = self.queue().dequeue_batch(self.inner.config.flush_batch_size.max(1));
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }
        let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();

        let sent = self.inner.transport.send_batch(&batch).await;
        match sent {
            Ok(()) => {
                let removed = self.queue().remove_by_ids(&ids)?;
                if let Err(e) = self.history().append(batch) {
                    warn!(error = %e, "failed to record delivered events in history");
                }
                info!(delivered = removed, "telemetry batch flushed");
                Ok(FlushOutcome::Delivered(removed))
            }
            Err(e) => {
                warn!(error = %e, batch = ids.len(), "telemetry flush failed; events kept for retry");
                let mut queue = self.queue();
                let retried = queue.increment_retries(&ids)?;
                let dropped = queue.drop_exceeded_retries(self.inner.config.max_retries)?;
                if !dropped.is_empty() {
                    warn!(
                        dropped = dropped.len(),
                        max_retries = self.inner.config.max_retries,
                        "dropped events that exhausted their retry budget"
                    );
                }
                Ok(FlushOutcome::Failed { retried, dropped: dropped.len() })
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Records connectivity. Returns `true` when this call moved offline -> online.
    pub fn set_online(&self, online: bool) -> bool {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(online, "connectivity changed");
        }
        online && !was
    }

    /// Connectivity restored: flushes immediately if we were offline.
    pub async fn notify_online(&self) -> Result<Option<FlushOutcome>, TelemetryError> {
        if self.set_online(true) {
            return self.flush().await.map(Some);
        }
        Ok(None)
    }

    pub fn notify_offline(&self) {
        self.set_online(false);
    }

    /// Follows a connectivity signal until [`TelemetryClient::destroy`] is called.
    /// Must be called from within a Tokio runtime.
    pub fn attach_connectivity(&self, mut signal: watch::Receiver<bool>) {
        let client = self.clone();
        let lifetime = self.inner.lifetime.clone();
        tokio::spawn(async move {
            loop {
                let online = *signal.borrow_and_update();
                let result = if online {
                    client.notify_online().await.map(|_| ())
                } else {
                    client.notify_offline();
                    Ok(())
                };
                if let Err(e) = result {
                    warn!(error = %e, "flush after reconnect failed");
                }

                tokio::select! {
                    _ = lifetime.cancelled() => break,
                    changed = signal.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("connectivity listener detached");
        });
    }

    /// Starts the periodic flush timer, replacing any running one.
    /// Must be called from within a Tokio runtime.
    pub fn start_auto_flush(&self) {
        let token = self.inner.lifetime.child_token();
        if let Some(previous) = self.auto_flush_slot().replace(token.clone()) {
            previous.cancel();
        }

        let period = Duration::from_millis(self.inner.config.flush_interval_ms.max(1));
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = client.flush().await {
                            warn!(error = %e, "scheduled flush failed");
                        }
                    }
                }
            }
            debug!("auto-flush timer stopped");
        });
        info!(interval_ms = self.inner.config.flush_interval_ms, "auto-flush started");
    }

    pub fn stop_auto_flush(&self) {
        if let Some(token) = self.auto_flush_slot().take() {
            token.cancel();
            info!("auto-flush stopped");
        }
    }

    pub fn is_auto_flushing(&self) -> bool {
        self.auto_flush_slot().as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Stops the timer and detaches connectivity listeners. In-flight flushes finish on their own.
    pub fn destroy(&self) {
        self.stop_auto_flush();
        self.inner.lifetime.cancel();
    }

    pub fn queued_events(&self) -> Vec<TelemetryEvent> {
        self.queue().all()
    }

    /// Delivered history followed by the pending queue, oldest first.
    /// This is the log the report engines read.
    pub fn event_log(&self) -> Vec<TelemetryEvent> {
        let mut log = self.history().all();
        log.extend(self.queue().iter().cloned());
        log
    }

    /// How many hourly ceilings `track` has seen exceeded since start.
    pub fn velocity_breaches(&self) -> u64 {
        self.inner.velocity_breaches.load(Ordering::SeqCst)
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue().snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.queue().len()
    }

    pub fn clear_queue(&self) -> Result<(), TelemetryError> {
        self.queue().clear().map_err(Into::into)
    }

    fn queue(&self) -> MutexGuard<'_, OfflineQueue> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, OfflineQueue> {
        self.inner.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn auto_flush_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.inner.auto_flush.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Logs when a policy's hourly ceilings would be exceeded and returns how many
/// were. Never blocks.
fn check_velocity<'a>(
    policy: &BusinessPolicy,
    event: &TelemetryEvent,
    log: impl Iterator<Item = &'a TelemetryEvent>,
    now: DateTime<Utc>,
) -> u64 {
    let window_start = now - ChronoDuration::hours(1);
    let recent: Vec<&TelemetryEvent> = log
        .filter(|e| e.policy_id.as_deref() == Some(policy.id.as_str()) && e.occurred_at > window_start)
        .collect();
    let mut breaches = 0;

    if let Some(ceiling) = policy.max_events_per_hour {
        if recent.len() + 1 > ceiling as usize {
            warn!(policy = %policy.id, ceiling, "policy velocity ceiling exceeded");
            breaches += 1;
        }
    }
    let ceiling = policy.schema(&event.event_id).and_then(|s| s.max_events_per_hour);
    if let Some(ceiling) = ceiling {
        let same_kind = recent.iter().filter(|e| e.event_id == event.event_id).count();
        if same_kind + 1 > ceiling as usize {
            warn!(policy = %policy.id, event = %event.event_id, ceiling, "event rate ceiling exceeded");
            breaches += 1;
        }
    }
    breaches
}
