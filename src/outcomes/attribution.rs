use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::governance::types::{ExperimentDesign, FeatureOutcomeSpec, KpiDefinition, TargetDirection};
use crate::telemetry::event::TelemetryEvent;

/// Weight used for services with no configured weight.
pub const DEFAULT_SERVICE_WEIGHT: f64 = 0.04;

const DEFAULT_CONTROL_GROUP: &str = "control";
const DEFAULT_TREATMENT_GROUP: &str = "treatment";
const UNSEGMENTED: &str = "unsegmented";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightSource {
    Configured,
    Default,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceWeights(BTreeMap<u32, f64>);

impl ServiceWeights {
    pub fn new(weights: BTreeMap<u32, f64>) -> Self {
        Self(weights)
    }

    /// Configured weight, or [`DEFAULT_SERVICE_WEIGHT`] for untagged or unmapped services.
    pub fn lookup(&self, service_id: Option<u32>) -> (f64, WeightSource) {
        match service_id.and_then(|id| self.0.get(&id)).filter(|w| w.is_finite()) {
            Some(weight) => (*weight, WeightSource::Configured),
            None => {
                debug!(?service_id, "no service weight configured; using default");
                (DEFAULT_SERVICE_WEIGHT, WeightSource::Default)
            }
        }
    }
}

/// KPI reading: `currentValue`, falling back to `value`.
fn metric_value(event: &TelemetryEvent) -> Option<f64> {
    event.number("currentValue").or_else(|| event.number("value"))
}

fn matches_metric(event: &TelemetryEvent, feature_id: &str, kpi_id: &str, measurement_event_id: &str) -> bool {
    event.event_id == measurement_event_id
        && event.text("featureId").map_or(true, |f| f == feature_id)
        && event.text("kpiId").map_or(true, |k| k == kpi_id)
        && metric_value(event).is_some()
}

fn belongs_to(event: &TelemetryEvent, feature_id: &str) -> bool {
    event.text("featureId") == Some(feature_id)
}

/// Signed progress toward the KPI target, in percent. Direction-aware.
pub fn target_progress_percent(kpi: &KpiDefinition, current_value: f64) -> f64 {
    let target = kpi.target_delta.abs();
    if target == 0.0 || !target.is_finite() {
        return 0.0;
    }
    let delta = current_value - kpi.baseline;
    let signed = match kpi.direction {
        TargetDirection::Increase => delta,
        TargetDirection::Decrease => -delta,
    };
    signed / target * 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiAttribution {
    pub feature_id: String,
    pub kpi_id: String,
    pub kpi_name: String,
    pub baseline: f64,
    pub current_value: Option<f64>,
    pub delta_from_baseline: Option<f64>,
    pub target_progress_percent: f64,
    pub measured_at: Option<DateTime<Utc>>,
    pub sample_count: usize,
    /// Share of all feature-tagged events that belong to this feature, in percent.
    pub impact_score: f64,
    pub service_weight: f64,
    pub weight_source: WeightSource,
    pub weighted_impact: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributionReport {
    pub total_feature_events: usize,
    pub rows: Vec<KpiAttribution>,
}

impl AttributionReport {
    pub fn row(&self, feature_id: &str, kpi_id: &str) -> Option<&KpiAttribution> {
        self.rows.iter().find(|r| r.feature_id == feature_id && r.kpi_id == kpi_id)
    }
}

/// Stateless projection over the event log, in recording order; recomputed on every call.
pub fn compute_attribution(
    specs: &[FeatureOutcomeSpec],
    events: &[TelemetryEvent],
    weights: &ServiceWeights,
) -> AttributionReport {
    let per_feature: HashMap<&str, usize> = specs
        .iter()
        .map(|s| (s.feature_id.as_str(), events.iter().filter(|e| belongs_to(e, &s.feature_id)).count()))
        .collect();
    let total_feature_events: usize = per_feature.values().sum();

    let mut rows = Vec::new();
    for spec in specs {
        let feature_events = per_feature.get(spec.feature_id.as_str()).copied().unwrap_or(0);
        let impact_score = if total_feature_events == 0 {
            0.0
        } else {
            feature_events as f64 / total_feature_events as f64 * 100.0
        };
        let (service_weight, weight_source) = weights.lookup(spec.service_id);

        for kpi in &spec.kpis {
            let samples: Vec<&TelemetryEvent> = events
                .iter()
                .filter(|e| matches_metric(e, &spec.feature_id, &kpi.kpi_id, &kpi.measurement_event_id))
                .collect();
            // Same-instant readings: the one recorded last wins.
            let latest = samples
                .iter()
                .enumerate()
                .max_by_key(|(position, e)| (e.occurred_at, *position))
                .map(|(_, e)| *e);
            let current_value = latest.and_then(metric_value);

            rows.push(KpiAttribution {
                feature_id: spec.feature_id.clone(),
                kpi_id: kpi.kpi_id.clone(),
                kpi_name: kpi.name.clone(),
                baseline: kpi.baseline,
                current_value,
                delta_from_baseline: current_value.map(|v| v - kpi.baseline),
                target_progress_percent: current_value.map_or(0.0, |v| target_progress_percent(kpi, v)),
                measured_at: latest.map(|e| e.occurred_at),
                sample_count: samples.len(),
                impact_score,
                service_weight,
                weight_source,
                weighted_impact: impact_score * service_weight,
            });
        }
    }

    AttributionReport { total_feature_events, rows }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentAttributionRequest {
    pub feature_id: String,
    pub kpi_id: String,
    pub measurement_event_id: String,
    pub control_group_id: String,
    pub treatment_group_id: String,
}

impl ExperimentAttributionRequest {
    /// Group ids come from an `ab_test` design; other designs use `control`/`treatment`.
    pub fn from_spec(spec: &FeatureOutcomeSpec, kpi_id: &str) -> Option<Self> {
        let kpi = spec.kpi(kpi_id)?;
        let (control, treatment) = match &spec.experiment.design {
            ExperimentDesign::AbTest { control_group_id, treatment_group_id } => {
                (control_group_id.clone(), treatment_group_id.clone())
            }
            _ => (DEFAULT_CONTROL_GROUP.to_string(), DEFAULT_TREATMENT_GROUP.to_string()),
        };
        Some(Self {
            feature_id: spec.feature_id.clone(),
            kpi_id: kpi.kpi_id.clone(),
            measurement_event_id: kpi.measurement_event_id.clone(),
            control_group_id: control,
            treatment_group_id: treatment,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub group_id: String,
    pub samples: usize,
    pub average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentStats {
    pub segment: String,
    pub samples: usize,
    pub average: f64,
    pub delta_vs_control: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentAttribution {
    pub feature_id: String,
    pub kpi_id: String,
    pub control: GroupStats,
    pub treatment: GroupStats,
    pub uplift_percent: f64,
    /// Treatment events bucketed by segment, compared to the control mean.
    pub segments: Vec<SegmentStats>,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// `(treatment − control) / |control| × 100`. With no usable control mean, any
/// positive treatment counts as 100% uplift and anything else as 0%.
pub fn uplift_percent(control: &GroupStats, treatment: &GroupStats) -> f64 {
    if control.samples > 0 && control.average != 0.0 {
        (treatment.average - control.average) / control.average.abs() * 100.0
    } else if treatment.samples > 0 && treatment.average > 0.0 {
        100.0
    } else {
        0.0
    }
}

fn segment_key(event: &TelemetryEvent) -> String {
    ["segmentId", "userSegment", "district"]
        .iter()
        .find_map(|field| event.field(field).and_then(|v| v.as_key()))
        .unwrap_or_else(|| UNSEGMENTED.to_string())
}

pub fn evaluate_experiment_attribution(
    events: &[TelemetryEvent],
    request: &ExperimentAttributionRequest,
) -> ExperimentAttribution {
    let mut control = Vec::new();
    let mut treatment = Vec::new();
    let mut segments: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    let matching = events
        .iter()
        .filter(|e| matches_metric(e, &request.feature_id, &request.kpi_id, &request.measurement_event_id));
    for event in matching {
        let Some(value) = metric_value(event) else { continue };
        // Unlabelled readings count as treatment.
        let group = event
            .text("experimentGroupId")
            .filter(|g| !g.trim().is_empty())
            .unwrap_or(request.treatment_group_id.as_str());

        if group == request.control_group_id {
            control.push(value);
        } else if group == request.treatment_group_id {
            treatment.push(value);
            segments.entry(segment_key(event)).or_default().push(value);
        }
    }

    let control = GroupStats {
        group_id: request.control_group_id.clone(),
        samples: control.len(),
        average: mean(&control),
    };
    let treatment = GroupStats {
        group_id: request.treatment_group_id.clone(),
        samples: treatment.len(),
        average: mean(&treatment),
    };
    let uplift_percent = uplift_percent(&control, &treatment);
    let segments = segments
        .into_iter()
        .map(|(segment, values)| {
            let average = mean(&values);
            SegmentStats {
                segment,
                samples: values.len(),
                average,
                delta_vs_control: average - control.average,
            }
        })
        .collect();

    ExperimentAttribution {
        feature_id: request.feature_id.clone(),
        kpi_id: request.kpi_id.clone(),
        control,
        treatment,
        uplift_percent,
        segments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kpi(direction: TargetDirection, baseline: f64, target: f64) -> KpiDefinition {
        KpiDefinition {
            kpi_id: "k".into(),
            name: "k".into(),
            unit: "count".into(),
            baseline,
            target_delta: target,
            direction,
            measurement_event_id: "FEATURE_KPI_METRIC".into(),
        }
    }

    #[test]
    fn decrease_targets_count_drops_as_progress() {
        let k = kpi(TargetDirection::Decrease, 40.0, -20.0);
        assert_eq!(target_progress_percent(&k, 30.0), 50.0);
        assert_eq!(target_progress_percent(&k, 50.0), -50.0);
    }

    #[test]
    fn zero_target_yields_zero_progress() {
        assert_eq!(target_progress_percent(&kpi(TargetDirection::Increase, 0.0, 0.0), 10.0), 0.0);
    }

    #[test]
    fn uplift_fallbacks_without_control() {
        let none = GroupStats::default();
        let positive = GroupStats { group_id: "t".into(), samples: 3, average: 12.0 };
        let negative = GroupStats { group_id: "t".into(), samples: 3, average: -1.0 };
        assert_eq!(uplift_percent(&none, &positive), 100.0);
        assert_eq!(uplift_percent(&none, &negative), 0.0);
        assert_eq!(uplift_percent(&none, &none), 0.0);
    }

    #[test]
    fn unmapped_services_use_visible_default_weight() {
        let weights = ServiceWeights::new(BTreeMap::from([(7, 0.25)]));
        assert_eq!(weights.lookup(Some(7)), (0.25, WeightSource::Configured));
        assert_eq!(weights.lookup(Some(8)), (DEFAULT_SERVICE_WEIGHT, WeightSource::Default));
        assert_eq!(weights.lookup(None), (DEFAULT_SERVICE_WEIGHT, WeightSource::Default));
    }
}
