use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::dataset::OfflineDatasetCache;
use crate::governance::{
    evaluate_release_readiness, ExperimentRegistry, FeatureOutcomeSpec, FeatureRegistry, GovernanceRegistry,
    ReleaseReadiness, SpecValidation,
};
use crate::outcomes::{
    compute_attribution, compute_roi_dashboard, evaluate_experiment_attribution, portfolio_dashboard,
    AttributionReport, ExperimentAttribution, ExperimentAttributionRequest, PortfolioDashboard, RoiDashboard,
    RoiRequest, ServiceWeights,
};
use crate::policy::PolicyRegistry;
use crate::store::{EncryptedStore, StoreError};
use crate::telemetry::{TelemetryClient, Transport};
use crate::time::Clock;

/// Owns every registry and the telemetry client for one process.
///
/// Construct one at startup and hand references to collaborators; tests build
/// a fresh context over an in-memory store.
pub struct AppContext<T> {
    pub store: Arc<EncryptedStore>,
    pub policies: Arc<PolicyRegistry>,
    pub telemetry: TelemetryClient<T>,
    pub datasets: OfflineDatasetCache,
    pub features: FeatureRegistry,
    pub governance: GovernanceRegistry,
    pub experiments: ExperimentRegistry,
    pub service_weights: ServiceWeights,
    pub eligible_users: u64,
}

impl<T: Transport> AppContext<T> {
    /// Wires everything over `store` and runs the one-time policy seeding.
    pub fn bootstrap(
        store: Arc<EncryptedStore>,
        transport: T,
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        online: bool,
    ) -> Result<Self, StoreError> {
        let policies = Arc::new(PolicyRegistry::new(Arc::clone(&store)));
        let seeded = policies.ensure_seeded()?;

        let telemetry = TelemetryClient::builder(config.telemetry.clone(), Arc::clone(&store), Arc::clone(&policies), transport)
            .clock(Arc::clone(&clock))
            .online(online)
            .build();

        info!(
            durable = store.is_durable(),
            seeded,
            queued = telemetry.queue_len(),
            "application context ready"
        );

        Ok(Self {
            datasets: OfflineDatasetCache::new(Arc::clone(&store), Arc::clone(&clock)),
            features: FeatureRegistry::new(Arc::clone(&store)),
            governance: GovernanceRegistry::new(Arc::clone(&store), Arc::clone(&clock)),
            experiments: ExperimentRegistry::new(Arc::clone(&store), clock),
            service_weights: ServiceWeights::new(config.service_weights.clone()),
            eligible_users: config.eligible_users,
            store,
            policies,
            telemetry,
        })
    }

    /// Registers the spec and, when valid, its experiment plan.
    pub fn register_feature(&self, spec: FeatureOutcomeSpec) -> Result<SpecValidation, StoreError> {
        let feature_id = spec.feature_id.clone();
        let plan = spec.experiment.clone();
        let validation = self.features.register_spec(spec)?;
        if validation.valid {
            self.experiments.register_plan(&feature_id, plan)?;
        }
        Ok(validation)
    }

    /// Readiness against events observed in the local log, checking both the
    /// spec's declared events and those of the feature's governance record.
    /// `None` for unknown features.
    pub fn release_readiness(&self, feature_id: &str) -> Option<ReleaseReadiness> {
        let spec = self.features.get_spec(feature_id)?;
        let record = self.governance.get(feature_id);
        let approvals = record.as_ref().map(|r| r.approvals).unwrap_or_default();
        let events = self.telemetry.event_log();
        Some(evaluate_release_readiness(
            &spec,
            record.as_ref().map(|r| &r.telemetry),
            &approvals,
            events.iter().map(|e| e.event_id.as_str()),
        ))
    }

    pub fn roi_dashboard(&self, request: &RoiRequest) -> RoiDashboard {
        let mut request = request.clone();
        if request.eligible_users == 0 {
            request.eligible_users = self.eligible_users;
        }
        compute_roi_dashboard(&self.telemetry.event_log(), &request)
    }

    pub fn portfolio(&self, requests: &[RoiRequest]) -> PortfolioDashboard {
        let dashboards: Vec<RoiDashboard> = requests.iter().map(|r| self.roi_dashboard(r)).collect();
        portfolio_dashboard(&dashboards)
    }

    pub fn attribution_report(&self) -> AttributionReport {
        compute_attribution(
            &self.features.list_specs(),
            &self.telemetry.event_log(),
            &self.service_weights,
        )
    }

    pub fn experiment_attribution(&self, feature_id: &str, kpi_id: &str) -> Option<ExperimentAttribution> {
        let spec = self.features.get_spec(feature_id)?;
        let request = ExperimentAttributionRequest::from_spec(&spec, kpi_id)?;
        Some(evaluate_experiment_attribution(&self.telemetry.event_log(), &request))
    }
}
