use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetDirection {
    Increase,
    Decrease,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiDefinition {
    pub kpi_id: String,
    pub name: String,
    pub unit: String,
    pub baseline: f64,
    pub target_delta: f64,
    pub direction: TargetDirection,
    /// Event kind whose `currentValue` measures this KPI.
    pub measurement_event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureOwners {
    pub product: String,
    pub engineering: String,
    pub analytics: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStep {
    pub percent: f64,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
}

/// Method-specific half of an experiment plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExperimentDesign {
    AbTest {
        control_group_id: String,
        treatment_group_id: String,
    },
    PhasedRollout {
        rollout_steps: Vec<RolloutStep>,
    },
    PrePost {
        pre_period_start: Option<DateTime<Utc>>,
        post_period_start: Option<DateTime<Utc>>,
    },
}

impl ExperimentDesign {
    pub fn method(&self) -> &'static str {
        match self {
            ExperimentDesign::AbTest { .. } => "ab_test",
            ExperimentDesign::PhasedRollout { .. } => "phased_rollout",
            ExperimentDesign::PrePost { .. } => "pre_post",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureExperimentPlan {
    pub hypothesis: String,
    pub traffic_percent: f64,
    pub segment_ids: Vec<String>,
    #[serde(flatten)]
    pub design: ExperimentDesign,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureOutcomeSpec {
    pub feature_id: String,
    pub name: String,
    pub release_id: String,
    #[serde(default)]
    pub service_id: Option<u32>,
    pub owners: FeatureOwners,
    pub primary_goals: Vec<String>,
    pub kpis: Vec<KpiDefinition>,
    pub experiment: FeatureExperimentPlan,
    /// Event kinds the feature promises to emit besides its KPI measurement events.
    #[serde(default)]
    pub instrumentation_events: Vec<String>,
}

impl FeatureOutcomeSpec {
    pub fn kpi(&self, kpi_id: &str) -> Option<&KpiDefinition> {
        self.kpis.iter().find(|k| k.kpi_id == kpi_id)
    }

    /// Every event id that must be observed before release, in declaration order.
    pub fn declared_event_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let declared = self
            .instrumentation_events
            .iter()
            .chain(self.kpis.iter().map(|k| &k.measurement_event_id));
        for id in declared {
            if !id.trim().is_empty() && !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

/// Structural validation result. Never an error: callers collect every problem at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpecValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl SpecValidation {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self { valid: errors.is_empty(), errors }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRole {
    Product,
    Engineering,
    Analytics,
}

impl fmt::Display for ApprovalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalRole::Product => write!(f, "product"),
            ApprovalRole::Engineering => write!(f, "engineering"),
            ApprovalRole::Analytics => write!(f, "analytics"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approvals {
    pub product: bool,
    pub engineering: bool,
    pub analytics: bool,
}

impl Approvals {
    pub fn all_granted() -> Self {
        Self { product: true, engineering: true, analytics: true }
    }

    pub fn set(&mut self, role: ApprovalRole, approved: bool) {
        match role {
            ApprovalRole::Product => self.product = approved,
            ApprovalRole::Engineering => self.engineering = approved,
            ApprovalRole::Analytics => self.analytics = approved,
        }
    }

    pub fn missing(&self) -> Vec<ApprovalRole> {
        [
            (ApprovalRole::Product, self.product),
            (ApprovalRole::Engineering, self.engineering),
            (ApprovalRole::Analytics, self.analytics),
        ]
        .into_iter()
        .filter(|(_, granted)| !granted)
        .map(|(role, _)| role)
        .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.product && self.engineering && self.analytics
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentedEvent {
    pub event_id: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

/// What a feature promises to emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureTelemetrySpec {
    pub feature_id: String,
    pub events: Vec<InstrumentedEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGovernanceRecord {
    pub feature_id: String,
    pub telemetry: FeatureTelemetrySpec,
    pub approvals: Approvals,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRecord {
    pub feature_id: String,
    pub plan: FeatureExperimentPlan,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReadiness {
    pub ready: bool,
    pub validation: SpecValidation,
    pub missing_approvals: Vec<ApprovalRole>,
    /// Declared event ids that have not fired yet.
    pub missing_events: Vec<String>,
}
