use std::collections::{BTreeSet, HashSet};

use super::types::{
    Approvals, ExperimentDesign, FeatureExperimentPlan, FeatureOutcomeSpec, FeatureTelemetrySpec,
    ReleaseReadiness, SpecValidation,
};

const MAX_PRIMARY_GOALS: usize = 3;

fn blank(s: &str) -> bool {
    s.trim().is_empty()
}

pub fn validate_feature_outcome_spec(spec: &FeatureOutcomeSpec) -> SpecValidation {
    let mut errors = Vec::new();

    if blank(&spec.feature_id) {
        errors.push("featureId is required".to_string());
    }
    if blank(&spec.name) {
        errors.push("name is required".to_string());
    }
    if blank(&spec.release_id) {
        errors.push("releaseId is required".to_string());
    }

    let goals = spec.primary_goals.len();
    if goals == 0 || goals > MAX_PRIMARY_GOALS {
        errors.push(format!("between 1 and {MAX_PRIMARY_GOALS} primary goals are required, found {goals}"));
    }
    if spec.primary_goals.iter().any(|g| blank(g)) {
        errors.push("primary goals must not be blank".to_string());
    }

    if spec.kpis.is_empty() {
        errors.push("at least one KPI is required".to_string());
    }
    let mut seen = HashSet::new();
    for (i, kpi) in spec.kpis.iter().enumerate() {
        if blank(&kpi.kpi_id) {
            errors.push(format!("kpis[{i}].kpiId is required"));
        } else if !seen.insert(kpi.kpi_id.as_str()) {
            errors.push(format!("duplicate KPI id `{}`", kpi.kpi_id));
        }
        if blank(&kpi.name) {
            errors.push(format!("kpis[{i}].name is required"));
        }
        if blank(&kpi.measurement_event_id) {
            errors.push(format!("kpis[{i}].measurementEventId is required"));
        }
    }

    errors.extend(validate_experiment_plan(&spec.experiment).errors);
    SpecValidation::from_errors(errors)
}

pub fn validate_experiment_plan(plan: &FeatureExperimentPlan) -> SpecValidation {
    let mut errors = Vec::new();

    match &plan.design {
        ExperimentDesign::AbTest { control_group_id, treatment_group_id } => {
            if blank(control_group_id) {
                errors.push("ab_test requires a control group id".to_string());
            }
            if blank(treatment_group_id) {
                errors.push("ab_test requires a treatment group id".to_string());
            }
        }
        ExperimentDesign::PhasedRollout { rollout_steps } => {
            if rollout_steps.is_empty() {
                errors.push("phased_rollout requires at least one rollout step".to_string());
            }
        }
        ExperimentDesign::PrePost { pre_period_start, post_period_start } => {
            if pre_period_start.is_none() {
                errors.push("pre_post requires a pre-period start".to_string());
            }
            if post_period_start.is_none() {
                errors.push("pre_post requires a post-period start".to_string());
            }
        }
    }

    // NaN fails both comparisons, so it is rejected too.
    if !(plan.traffic_percent > 0.0 && plan.traffic_percent <= 100.0) {
        errors.push(format!("trafficPercent must be within (0, 100], got {}", plan.traffic_percent));
    }
    if plan.segment_ids.is_empty() {
        errors.push("at least one segment id is required".to_string());
    }

    SpecValidation::from_errors(errors)
}

pub fn validate_telemetry_spec(spec: &FeatureTelemetrySpec) -> SpecValidation {
    let mut errors = Vec::new();

    if blank(&spec.feature_id) {
        errors.push("featureId is required".to_string());
    }
    if spec.events.is_empty() {
        errors.push("at least one instrumented event is required".to_string());
    }
    let mut seen = HashSet::new();
    for (i, event) in spec.events.iter().enumerate() {
        if blank(&event.event_id) {
            errors.push(format!("events[{i}].eventId is required"));
        } else if !seen.insert(event.event_id.as_str()) {
            errors.push(format!("duplicate instrumented event `{}`", event.event_id));
        }
        if event.required_fields.iter().any(|f| blank(f)) {
            errors.push(format!("events[{i}] has a blank required field name"));
        }
    }

    SpecValidation::from_errors(errors)
}

/// A feature may ship only when its spec is valid, all three owners signed off,
/// and every declared event has actually been observed at least once. Declared
/// events are the spec's own plus those of its instrumentation record, if any.
pub fn evaluate_release_readiness<'a, I>(
    spec: &FeatureOutcomeSpec,
    telemetry: Option<&FeatureTelemetrySpec>,
    approvals: &Approvals,
    observed_event_ids: I,
) -> ReleaseReadiness
where
    I: IntoIterator<Item = &'a str>,
{
    let validation = validate_feature_outcome_spec(spec);
    let observed: BTreeSet<&str> = observed_event_ids.into_iter().collect();

    let mut declared = spec.declared_event_ids();
    for event in telemetry.into_iter().flat_map(|t| &t.events) {
        if !blank(&event.event_id) && !declared.contains(&event.event_id) {
            declared.push(event.event_id.clone());
        }
    }
    let missing_events: Vec<String> = declared
        .into_iter()
        .filter(|id| !observed.contains(id.as_str()))
        .collect();
    let missing_approvals = approvals.missing();

    ReleaseReadiness {
        ready: validation.valid && missing_approvals.is_empty() && missing_events.is_empty(),
        validation,
        missing_approvals,
        missing_events,
    }
}
