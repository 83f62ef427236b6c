use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use super::event::TelemetryEvent;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink rejected batch with status {0}")]
    Rejected(u16),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Remote sink for event batches.
///
/// A batch is all-or-nothing: `Ok` means every event was accepted, any error
/// means none were. Timeouts are the transport's own business.
pub trait Transport: Send + Sync + 'static {
    fn send_batch(&self, events: &[TelemetryEvent]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[derive(Serialize)]
struct BatchBody<'a> {
    events: &'a [TelemetryEvent],
}

/// POSTs `{"events": [...]}` to a collector endpoint.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
        }
    }
}

impl Transport for HttpTransport {
    async fn send_batch(&self, events: &[TelemetryEvent]) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&BatchBody { events })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Accepts every batch and logs it. Used when no collector is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

impl Transport for LogTransport {
    async fn send_batch(&self, events: &[TelemetryEvent]) -> Result<(), TransportError> {
        info!(count = events.len(), "telemetry batch delivered to log sink");
        Ok(())
    }
}

/// In-process sink that remembers every delivered batch and can be switched into
/// failure mode. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    batches: Arc<Mutex<Vec<Vec<TelemetryEvent>>>>,
    failing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that rejects every batch until `set_failing(false)`.
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<TelemetryEvent>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn delivered(&self) -> Vec<TelemetryEvent> {
        self.batches().into_iter().flatten().collect()
    }
}

impl Transport for RecordingTransport {
    async fn send_batch(&self, events: &[TelemetryEvent]) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("recording transport set to fail".into()));
        }
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(events.to_vec());
        Ok(())
    }
}
