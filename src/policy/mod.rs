//! Business policies: the contract every tracked event must satisfy.

pub mod defaults;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::store::{EncryptedStore, StoreError};
use crate::telemetry::event::Payload;

pub const POLICY_SLOT: &str = "policies";
const SEEDED_SLOT: &str = "policies.seeded";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEventSchema {
    pub event_id: String,
    pub required_fields: Vec<String>,
    /// Known but not enforced. Only used to tell unknown fields apart.
    #[serde(default)]
    pub optional_fields: Vec<String>,
    #[serde(default)]
    pub max_events_per_hour: Option<u32>,
}

impl PolicyEventSchema {
    pub fn new(event_id: impl Into<String>, required: &[&str]) -> Self {
        Self {
            event_id: event_id.into(),
            required_fields: required.iter().map(|f| f.to_string()).collect(),
            optional_fields: Vec::new(),
            max_events_per_hour: None,
        }
    }

    pub fn with_optional(mut self, optional: &[&str]) -> Self {
        self.optional_fields = optional.iter().map(|f| f.to_string()).collect();
        self
    }

    fn knows(&self, field: &str) -> bool {
        self.required_fields.iter().chain(&self.optional_fields).any(|f| f == field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessPolicy {
    pub id: String,
    pub name: String,
    pub purpose: String,
    pub owner_team: String,
    pub approved_at: DateTime<Utc>,
    pub events: Vec<PolicyEventSchema>,
    #[serde(default)]
    pub max_events_per_hour: Option<u32>,
}

impl BusinessPolicy {
    pub fn schema(&self, event_id: &str) -> Option<&PolicyEventSchema> {
        self.events.iter().find(|s| s.event_id == event_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PolicyValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    /// Non-fatal findings, e.g. fields the schema does not declare.
    pub warnings: Vec<String>,
}

impl PolicyValidation {
    fn finish(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self { valid: errors.is_empty(), errors, warnings }
    }
}

/// Persisted policy catalog.
///
/// Built-in policies are merged in by [`PolicyRegistry::ensure_seeded`], which the
/// application context calls once at startup. Reads never seed implicitly.
pub struct PolicyRegistry {
    store: Arc<EncryptedStore>,
    seeded: AtomicBool,
    write_lock: Mutex<()>,
}

impl PolicyRegistry {
    pub fn new(store: Arc<EncryptedStore>) -> Self {
        Self {
            store,
            seeded: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    /// Inserts every built-in policy that has never been seeded before and is not
    /// already persisted. Returns how many were inserted. Safe to call repeatedly.
    pub fn ensure_seeded(&self) -> Result<usize, StoreError> {
        if self.seeded.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut policies = self.load();
        let mut seeded: BTreeSet<String> = self.store.read(SEEDED_SLOT, BTreeSet::new());
        let mut inserted = 0;

        for policy in defaults::default_policies() {
            if seeded.contains(&policy.id) {
                continue;
            }
            seeded.insert(policy.id.clone());
            if policies.iter().any(|p| p.id == policy.id) {
                continue;
            }
            policies.push(policy);
            inserted += 1;
        }

        if inserted > 0 {
            self.store.write(POLICY_SLOT, &policies)?;
            info!(inserted, "seeded built-in policies");
        }
        self.store.write(SEEDED_SLOT, &seeded)?;
        self.seeded.store(true, Ordering::SeqCst);
        Ok(inserted)
    }

    /// Inserts or replaces a policy by id.
    pub fn register_policy(&self, policy: BusinessPolicy) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut policies = self.load();
        match policies.iter_mut().find(|p| p.id == policy.id) {
            Some(existing) => *existing = policy,
            None => policies.push(policy),
        }
        self.store.write(POLICY_SLOT, &policies)?;
        self.seeded.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn remove_policy(&self, policy_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut policies = self.load();
        let before = policies.len();
        policies.retain(|p| p.id != policy_id);
        if policies.len() == before {
            return Ok(false);
        }
        self.store.write(POLICY_SLOT, &policies)?;
        Ok(true)
    }

    pub fn get_policy(&self, policy_id: &str) -> Option<BusinessPolicy> {
        self.load().into_iter().find(|p| p.id == policy_id)
    }

    pub fn list_policies(&self) -> Vec<BusinessPolicy> {
        self.load()
    }

    pub fn validate_event(&self, policy_id: &str, event_id: &str, payload: &Payload) -> PolicyValidation {
        match self.get_policy(policy_id) {
            Some(policy) => validate_against(&policy, event_id, payload),
            None => PolicyValidation::finish(vec![format!("policy `{policy_id}` is not registered")], Vec::new()),
        }
    }

    fn load(&self) -> Vec<BusinessPolicy> {
        self.store.read(POLICY_SLOT, Vec::new())
    }
}

/// Checks `payload` against the schema for `event_id` under `policy`.
pub fn validate_against(policy: &BusinessPolicy, event_id: &str, payload: &Payload) -> PolicyValidation {
    let Some(schema) = policy.schema(event_id) else {
        return PolicyValidation::finish(
            vec![format!("event `{event_id}` is not declared by policy `{}`", policy.id)],
            Vec::new(),
        );
    };

    // Presence only: null, false, 0 and "" all satisfy a required field.
    let errors = schema
        .required_fields
        .iter()
        .filter(|field| !payload.contains_key(field.as_str()))
        .map(|field| format!("missing required field `{field}` for `{}`/`{event_id}`", policy.id))
        .collect();

    let warnings = payload
        .keys()
        .filter(|key| !schema.knows(key))
        .map(|key| format!("field `{key}` is not declared for `{}`/`{event_id}`", policy.id))
        .collect();

    PolicyValidation::finish(errors, warnings)
}
