//! Read-only reports over the event log: ROI dashboards and outcome attribution.
//! Nothing here is persisted; every report is recomputed from the events it is given.

pub mod attribution;
pub mod roi;

pub use attribution::{
    compute_attribution, evaluate_experiment_attribution, AttributionReport, ExperimentAttribution,
    ExperimentAttributionRequest, KpiAttribution, ServiceWeights, WeightSource, DEFAULT_SERVICE_WEIGHT,
};
pub use roi::{
    compute_roi_dashboard, portfolio_dashboard, CostInputs, PortfolioDashboard, Recommendation, RoiDashboard,
    RoiRequest,
};
