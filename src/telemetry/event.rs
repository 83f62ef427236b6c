use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A primitive payload value. Payloads never nest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Finite numeric view. Numeric strings count; everything else is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        let n = match self {
            FieldValue::Number(n) => *n,
            FieldValue::Text(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        n.is_finite().then_some(n)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Identifier view used for user/segment keys: non-empty text, or an integral number.
    pub fn as_key(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            FieldValue::Number(n) if n.is_finite() => Some(n.to_string()),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Number(v as f64)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Number(f64::from(v))
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Number(f64::from(v))
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

/// Flat field map carried by every event.
pub type Payload = BTreeMap<String, FieldValue>;

/// Builds a [`Payload`] from `key => value` pairs.
#[macro_export]
macro_rules! payload {
    () => { $crate::telemetry::event::Payload::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut p = $crate::telemetry::event::Payload::new();
        $( p.insert(($key).to_string(), $crate::telemetry::event::FieldValue::from($value)); )+
        p
    }};
}

/// A recorded telemetry event. `id` and `occurred_at` never change once queued;
/// `retries` only grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub id: String,
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<u32>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub retries: u32,
}

impl TelemetryEvent {
    pub fn new(event_id: impl Into<String>, payload: Payload, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_id: event_id.into(),
            policy_id: None,
            service_id: None,
            occurred_at,
            payload,
            retries: 0,
        }
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    pub fn with_service(mut self, service_id: Option<u32>) -> Self {
        self.service_id = service_id;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.payload.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(FieldValue::as_f64)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FieldValue::as_str)
    }
}
