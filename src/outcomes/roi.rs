use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::telemetry::event::TelemetryEvent;

/// Hourly rate assumed when no event carries an `hourlyRate` signal.
pub const DEFAULT_HOURLY_RATE: f64 = 150.0;

const USER_ID_FIELDS: [&str; 4] = ["userId", "farmerId", "deviceId", "sessionId"];

const SCALE_MIN_ROI: f64 = 30.0;
const SCALE_MIN_ADOPTION: f64 = 40.0;
const RETIRE_MAX_ADOPTION: f64 = 15.0;

pub(crate) fn round2(value: f64) -> f64 {
    if value.is_finite() {
        (value * 100.0).round() / 100.0
    } else {
        0.0
    }
}

fn finite_or_zero(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CostInputs {
    pub development: Option<f64>,
    pub infrastructure: Option<f64>,
    pub operations: Option<f64>,
    pub support: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostModel {
    pub development: f64,
    pub infrastructure: f64,
    pub operations: f64,
    pub support: f64,
    pub total: f64,
}

impl CostModel {
    /// Missing or non-finite buckets become 0; every bucket is rounded to cents.
    pub fn normalize(inputs: &CostInputs) -> Self {
        let development = round2(finite_or_zero(inputs.development));
        let infrastructure = round2(finite_or_zero(inputs.infrastructure));
        let operations = round2(finite_or_zero(inputs.operations));
        let support = round2(finite_or_zero(inputs.support));
        Self {
            development,
            infrastructure,
            operations,
            support,
            total: round2(development + infrastructure + operations + support),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueModel {
    pub incremental_revenue: f64,
    pub cost_savings: f64,
    pub productivity_value: f64,
    /// Explicit `timeSavedValue` plus `hoursSaved` priced at `hourly_rate`.
    pub time_saved_value: f64,
    pub hours_saved: f64,
    pub hourly_rate: f64,
    pub qualitative_benefit_value: f64,
    pub total_benefits: f64,
}

impl ValueModel {
    pub fn from_events(events: &[&TelemetryEvent]) -> Self {
        let sum = |field: &str| -> f64 { events.iter().map(|e| finite_or_zero(e.number(field))).sum() };

        let rates: Vec<f64> = events
            .iter()
            .filter_map(|e| e.number("hourlyRate"))
            .filter(|r| *r > 0.0)
            .collect();
        let hourly_rate = if rates.is_empty() {
            DEFAULT_HOURLY_RATE
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };

        let incremental_revenue = sum("incrementalRevenue");
        let cost_savings = sum("costSavings");
        let productivity_value = sum("productivityValue");
        let hours_saved = sum("hoursSaved");
        let time_saved_value = sum("timeSavedValue") + hours_saved * hourly_rate;
        let qualitative_benefit_value = sum("qualitativeBenefitValue");

        Self {
            incremental_revenue: round2(incremental_revenue),
            cost_savings: round2(cost_savings),
            productivity_value: round2(productivity_value),
            time_saved_value: round2(time_saved_value),
            hours_saved: round2(hours_saved),
            hourly_rate: round2(hourly_rate),
            qualitative_benefit_value: round2(qualitative_benefit_value),
            total_benefits: round2(
                incremental_revenue + cost_savings + productivity_value + time_saved_value + qualitative_benefit_value,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    /// `YYYY-MM`.
    pub period: String,
    pub value: f64,
    /// Change from the previous period; 0 for the first.
    pub delta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadingIndicators {
    pub total_events: usize,
    pub active_users: usize,
    pub eligible_users: u64,
    pub adoption_rate_percent: f64,
    pub engagement_per_user: f64,
    pub adoption_trend: Vec<TrendPoint>,
    pub engagement_trend: Vec<TrendPoint>,
}

impl LeadingIndicators {
    pub fn from_events(events: &[&TelemetryEvent], eligible_users: u64) -> Self {
        let mut users = BTreeSet::new();
        let mut monthly_users: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut monthly_events: BTreeMap<String, usize> = BTreeMap::new();

        for event in events {
            let period = event.occurred_at.format("%Y-%m").to_string();
            *monthly_events.entry(period.clone()).or_default() += 1;
            let bucket = monthly_users.entry(period).or_default();
            if let Some(user) = user_key(event) {
                bucket.insert(user.clone());
                users.insert(user);
            }
        }

        let active_users = users.len();
        let denominator = eligible_users.max(active_users as u64);
        let adoption_rate_percent = if denominator == 0 {
            0.0
        } else {
            active_users as f64 / denominator as f64 * 100.0
        };
        let engagement_per_user = if active_users == 0 {
            0.0
        } else {
            events.len() as f64 / active_users as f64
        };

        Self {
            total_events: events.len(),
            active_users,
            eligible_users,
            adoption_rate_percent: round2(adoption_rate_percent),
            engagement_per_user: round2(engagement_per_user),
            adoption_trend: trend(monthly_users.into_iter().map(|(p, u)| (p, u.len() as f64))),
            engagement_trend: trend(monthly_events.into_iter().map(|(p, n)| (p, n as f64))),
        }
    }

    pub fn latest_engagement_delta(&self) -> f64 {
        self.engagement_trend.last().map_or(0.0, |p| p.delta)
    }
}

/// First user-identifying field present on the event.
fn user_key(event: &TelemetryEvent) -> Option<String> {
    USER_ID_FIELDS
        .iter()
        .find_map(|field| event.field(field).and_then(|v| v.as_key()).map(|v| format!("{field}:{v}")))
}

fn trend(buckets: impl Iterator<Item = (String, f64)>) -> Vec<TrendPoint> {
    let mut previous: Option<f64> = None;
    buckets
        .map(|(period, value)| {
            let delta = previous.map_or(0.0, |p| value - p);
            previous = Some(value);
            TrendPoint { period, value, delta }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Scale,
    Iterate,
    Retire,
}

pub fn recommend(roi_percent: f64, adoption_rate_percent: f64, engagement_delta: f64) -> Recommendation {
    if roi_percent >= SCALE_MIN_ROI && adoption_rate_percent >= SCALE_MIN_ADOPTION && engagement_delta >= 0.0 {
        Recommendation::Scale
    } else if roi_percent < 0.0 && adoption_rate_percent < RETIRE_MAX_ADOPTION && engagement_delta < 0.0 {
        Recommendation::Retire
    } else {
        Recommendation::Iterate
    }
}

fn roi_percent(net_value: f64, total_costs: f64) -> f64 {
    if total_costs == 0.0 {
        0.0
    } else {
        round2(net_value / total_costs * 100.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoiRequest {
    /// Label for the dashboard; events are selected by `service_id`, not by this.
    pub feature_id: String,
    pub service_id: Option<u32>,
    pub costs: CostInputs,
    pub eligible_users: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoiDashboard {
    pub feature_id: String,
    pub service_id: Option<u32>,
    pub value: ValueModel,
    pub costs: CostModel,
    pub net_value: f64,
    pub roi_percent: f64,
    pub indicators: LeadingIndicators,
    pub recommendation: Recommendation,
}

/// Builds a dashboard from the events tagged with `request.service_id`
/// (all events when no service is given).
pub fn compute_roi_dashboard(events: &[TelemetryEvent], request: &RoiRequest) -> RoiDashboard {
    let selected: Vec<&TelemetryEvent> = events
        .iter()
        .filter(|e| request.service_id.map_or(true, |s| e.service_id == Some(s)))
        .collect();

    let value = ValueModel::from_events(&selected);
    let costs = CostModel::normalize(&request.costs);
    let net_value = round2(value.total_benefits - costs.total);
    let roi_percent = roi_percent(net_value, costs.total);
    let indicators = LeadingIndicators::from_events(&selected, request.eligible_users);
    let recommendation = recommend(
        roi_percent,
        indicators.adoption_rate_percent,
        indicators.latest_engagement_delta(),
    );

    RoiDashboard {
        feature_id: request.feature_id.clone(),
        service_id: request.service_id,
        value,
        costs,
        net_value,
        roi_percent,
        indicators,
        recommendation,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecommendationCounts {
    pub scale: usize,
    pub iterate: usize,
    pub retire: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioDashboard {
    pub feature_count: usize,
    pub total_benefits: f64,
    pub total_costs: f64,
    pub net_value: f64,
    pub roi_percent: f64,
    pub active_users: usize,
    pub recommendations: RecommendationCounts,
}

pub fn portfolio_dashboard(dashboards: &[RoiDashboard]) -> PortfolioDashboard {
    let total_benefits = round2(dashboards.iter().map(|d| d.value.total_benefits).sum());
    let total_costs = round2(dashboards.iter().map(|d| d.costs.total).sum());
    let net_value = round2(total_benefits - total_costs);

    let mut recommendations = RecommendationCounts::default();
    for dashboard in dashboards {
        match dashboard.recommendation {
            Recommendation::Scale => recommendations.scale += 1,
            Recommendation::Iterate => recommendations.iterate += 1,
            Recommendation::Retire => recommendations.retire += 1,
        }
    }

    PortfolioDashboard {
        feature_count: dashboards.len(),
        total_benefits,
        total_costs,
        net_value,
        roi_percent: roi_percent(net_value, total_costs),
        active_users: dashboards.iter().map(|d| d.indicators.active_users).sum(),
        recommendations,
    }
}
