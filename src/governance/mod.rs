//! Feature governance: outcome specs, instrumentation sign-off and experiment designs.
//!
//! Validation failures are values ([`SpecValidation`]), never errors, so a batch of
//! registrations can report every problem in one pass.

pub mod registry;
pub mod types;
pub mod validation;

pub use registry::{ExperimentRegistry, FeatureRegistry, GovernanceRegistry};
pub use types::*;
pub use validation::{
    evaluate_release_readiness, validate_experiment_plan, validate_feature_outcome_spec, validate_telemetry_spec,
};
