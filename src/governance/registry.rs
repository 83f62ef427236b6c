use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use super::types::{
    ApprovalRole, Approvals, ExperimentRecord, FeatureExperimentPlan, FeatureGovernanceRecord,
    FeatureOutcomeSpec, FeatureTelemetrySpec, SpecValidation,
};
use super::validation::{validate_experiment_plan, validate_feature_outcome_spec, validate_telemetry_spec};
use crate::store::{EncryptedStore, StoreError};
use crate::time::Clock;

pub const GOVERNANCE_SLOT: &str = "governance.records";
pub const FEATURE_SPEC_SLOT: &str = "feature.specs";
pub const EXPERIMENT_SLOT: &str = "feature.experiments";

/// A list persisted in one slot, keyed by feature id.
struct Catalog<T> {
    store: Arc<EncryptedStore>,
    slot: &'static str,
    lock: Mutex<()>,
    key: fn(&T) -> &str,
}

impl<T: Serialize + DeserializeOwned + Clone> Catalog<T> {
    fn new(store: Arc<EncryptedStore>, slot: &'static str, key: fn(&T) -> &str) -> Self {
        Self { store, slot, lock: Mutex::new(()), key }
    }

    fn all(&self) -> Vec<T> {
        self.store.read(self.slot, Vec::new())
    }

    fn get(&self, id: &str) -> Option<T> {
        self.all().into_iter().find(|item| (self.key)(item) == id)
    }

    /// Applies `edit` to the entry for `id` (or `None` if absent) and persists the result.
    fn upsert(&self, id: &str, edit: impl FnOnce(Option<T>) -> T) -> Result<T, StoreError> {
        let _guard = self.guard();
        let mut items = self.all();
        let position = items.iter().position(|item| (self.key)(item) == id);
        let updated = edit(position.map(|i| items[i].clone()));
        match position {
            Some(i) => items[i] = updated.clone(),
            None => items.push(updated.clone()),
        }
        self.store.write(self.slot, &items)?;
        Ok(updated)
    }

    /// Edits an existing entry in place. Returns `None` if there is no entry for `id`.
    fn update(&self, id: &str, edit: impl FnOnce(&mut T)) -> Result<Option<T>, StoreError> {
        let _guard = self.guard();
        let mut items = self.all();
        let Some(item) = items.iter_mut().find(|item| (self.key)(item) == id) else {
            return Ok(None);
        };
        edit(item);
        let updated = item.clone();
        self.store.write(self.slot, &items)?;
        Ok(Some(updated))
    }

    fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.guard();
        let mut items = self.all();
        let before = items.len();
        items.retain(|item| (self.key)(item) != id);
        if items.len() == before {
            return Ok(false);
        }
        self.store.write(self.slot, &items)?;
        Ok(true)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn spec_key(spec: &FeatureOutcomeSpec) -> &str {
    &spec.feature_id
}

fn record_key(record: &FeatureGovernanceRecord) -> &str {
    &record.feature_id
}

fn experiment_key(record: &ExperimentRecord) -> &str {
    &record.feature_id
}

/// Persisted feature outcome specs. Only structurally valid specs are stored.
pub struct FeatureRegistry {
    specs: Catalog<FeatureOutcomeSpec>,
}

impl FeatureRegistry {
    pub fn new(store: Arc<EncryptedStore>) -> Self {
        Self {
            specs: Catalog::new(store, FEATURE_SPEC_SLOT, spec_key),
        }
    }

    pub fn register_spec(&self, spec: FeatureOutcomeSpec) -> Result<SpecValidation, StoreError> {
        let validation = validate_feature_outcome_spec(&spec);
        if !validation.valid {
            warn!(feature = %spec.feature_id, errors = ?validation.errors, "feature spec rejected");
            return Ok(validation);
        }
        let id = spec.feature_id.clone();
        self.specs.upsert(&id, |_| spec)?;
        info!(feature = %id, "feature spec registered");
        Ok(validation)
    }

    pub fn get_spec(&self, feature_id: &str) -> Option<FeatureOutcomeSpec> {
        self.specs.get(feature_id)
    }

    pub fn list_specs(&self) -> Vec<FeatureOutcomeSpec> {
        self.specs.all()
    }

    pub fn remove_spec(&self, feature_id: &str) -> Result<bool, StoreError> {
        self.specs.remove(feature_id)
    }
}

/// Persisted instrumentation specs plus their tri-part sign-off.
pub struct GovernanceRegistry {
    records: Catalog<FeatureGovernanceRecord>,
    clock: Arc<dyn Clock>,
}

impl GovernanceRegistry {
    pub fn new(store: Arc<EncryptedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Catalog::new(store, GOVERNANCE_SLOT, record_key),
            clock,
        }
    }

    /// Creates the record, or replaces its telemetry spec keeping approvals and
    /// creation time. Invalid specs are reported and never stored.
    pub fn register(&self, telemetry: FeatureTelemetrySpec) -> Result<SpecValidation, StoreError> {
        let validation = validate_telemetry_spec(&telemetry);
        if !validation.valid {
            warn!(feature = %telemetry.feature_id, errors = ?validation.errors, "telemetry spec rejected");
            return Ok(validation);
        }

        let now = self.clock.now();
        let id = telemetry.feature_id.clone();
        self.records.upsert(&id, |existing| match existing {
            Some(record) => FeatureGovernanceRecord { telemetry, updated_at: now, ..record },
            None => FeatureGovernanceRecord {
                feature_id: id.clone(),
                telemetry,
                approvals: Approvals::default(),
                created_at: now,
                updated_at: now,
            },
        })?;
        Ok(validation)
    }

    /// Sets one role's approval. Returns `None` when the feature has no record.
    pub fn set_approval(
        &self,
        feature_id: &str,
        role: ApprovalRole,
        approved: bool,
    ) -> Result<Option<FeatureGovernanceRecord>, StoreError> {
        let now = self.clock.now();
        let record = self.records.update(feature_id, |record| {
            record.approvals.set(role, approved);
            record.updated_at = now;
        })?;
        if record.is_some() {
            info!(feature = %feature_id, %role, approved, "approval updated");
        }
        Ok(record)
    }

    pub fn get(&self, feature_id: &str) -> Option<FeatureGovernanceRecord> {
        self.records.get(feature_id)
    }

    pub fn list(&self) -> Vec<FeatureGovernanceRecord> {
        self.records.all()
    }

    pub fn approvals(&self, feature_id: &str) -> Approvals {
        self.get(feature_id).map(|r| r.approvals).unwrap_or_default()
    }

    /// Records still waiting on at least one sign-off.
    pub fn pending_approvals(&self) -> Vec<FeatureGovernanceRecord> {
        self.list().into_iter().filter(|r| !r.approvals.is_complete()).collect()
    }
}

/// Persisted experiment designs, one per feature.
pub struct ExperimentRegistry {
    plans: Catalog<ExperimentRecord>,
    clock: Arc<dyn Clock>,
}

impl ExperimentRegistry {
    pub fn new(store: Arc<EncryptedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            plans: Catalog::new(store, EXPERIMENT_SLOT, experiment_key),
            clock,
        }
    }

    pub fn register_plan(&self, feature_id: &str, plan: FeatureExperimentPlan) -> Result<SpecValidation, StoreError> {
        let mut errors = Vec::new();
        if feature_id.trim().is_empty() {
            errors.push("featureId is required".to_string());
        }
        errors.extend(validate_experiment_plan(&plan).errors);
        let validation = SpecValidation::from_errors(errors);
        if !validation.valid {
            warn!(feature = %feature_id, errors = ?validation.errors, "experiment plan rejected");
            return Ok(validation);
        }

        let now = self.clock.now();
        self.plans.upsert(feature_id, |_| ExperimentRecord {
            feature_id: feature_id.to_string(),
            plan,
            registered_at: now,
        })?;
        Ok(validation)
    }

    pub fn get_plan(&self, feature_id: &str) -> Option<FeatureExperimentPlan> {
        self.plans.get(feature_id).map(|r| r.plan)
    }

    pub fn list_plans(&self) -> Vec<ExperimentRecord> {
        self.plans.all()
    }
}
