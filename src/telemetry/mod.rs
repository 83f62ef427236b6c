//! Offline-first telemetry: typed events, a bounded persisted queue, and a
//! client that gates every business event on policy validation before it is
//! recorded.
//!
//! # Delivery
//! Events leave the device only through [`transport::Transport::send_batch`].
//! A failed batch stays queued with its retry counters bumped; an event is
//! dropped once its counter exceeds `max_retries`.

pub mod client;
pub mod event;
pub mod queue;
pub mod transport;

pub use client::{FlushOutcome, KpiMetric, TelemetryClient, TelemetryError, TrackRequest};
pub use event::{FieldValue, Payload, TelemetryEvent};
pub use queue::{OfflineQueue, QueueSnapshot};
pub use transport::{HttpTransport, LogTransport, RecordingTransport, Transport, TransportError};
