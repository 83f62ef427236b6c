use chrono::{TimeZone, Utc};

use super::{BusinessPolicy, PolicyEventSchema};

fn schema(event_id: &str, required: &[&str], optional: &[&str], per_hour: Option<u32>) -> PolicyEventSchema {
    PolicyEventSchema {
        event_id: event_id.to_string(),
        required_fields: required.iter().map(|f| f.to_string()).collect(),
        optional_fields: optional.iter().map(|f| f.to_string()).collect(),
        max_events_per_hour: per_hour,
    }
}

/// Policies every installation starts with.
pub fn default_policies() -> Vec<BusinessPolicy> {
    let approved_at = Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).single().unwrap_or_default();

    vec![
        BusinessPolicy {
            id: "POL_MARKET_PRICING".into(),
            name: "Market price transparency".into(),
            purpose: "Measure how farmers use mandi price lookups and alerts".into(),
            owner_team: "market-intelligence".into(),
            approved_at,
            events: vec![
                schema("PRICE_QUERY", &["commodity", "district", "queryCount"], &["market", "userId", "farmerId"], Some(600)),
                schema("PRICE_ALERT_SET", &["commodity", "district", "thresholdPrice"], &["userId", "farmerId"], Some(60)),
            ],
            max_events_per_hour: Some(1000),
        },
        BusinessPolicy {
            id: "POL_SCHEME_DISCOVERY".into(),
            name: "Scheme discovery".into(),
            purpose: "Track discovery and uptake of government schemes".into(),
            owner_team: "schemes".into(),
            approved_at,
            events: vec![
                schema("SCHEME_VIEWED", &["schemeId", "district"], &["category", "userId", "farmerId"], None),
                schema("SCHEME_APPLICATION_STARTED", &["schemeId", "district"], &["userId", "farmerId"], Some(120)),
            ],
            max_events_per_hour: None,
        },
        BusinessPolicy {
            id: "POL_CROP_ADVISORY".into(),
            name: "Crop advisory".into(),
            purpose: "Measure reach and usefulness of crop advisories".into(),
            owner_team: "agronomy".into(),
            approved_at,
            events: vec![
                schema("ADVISORY_VIEWED", &["cropId", "district"], &["season", "userId", "farmerId"], None),
                schema("ADVISORY_FEEDBACK", &["cropId", "rating"], &["comment", "userId", "farmerId"], Some(60)),
            ],
            max_events_per_hour: Some(2000),
        },
        BusinessPolicy {
            id: "POL_CALCULATOR_USAGE".into(),
            name: "Calculator usage".into(),
            purpose: "Understand which farm calculators are used and how often".into(),
            owner_team: "tools".into(),
            approved_at,
            events: vec![schema("CALCULATOR_RUN", &["calculatorId", "inputCount"], &["userId", "sessionId"], None)],
            max_events_per_hour: None,
        },
    ]
}
