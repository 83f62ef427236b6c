use chrono::Utc;
use pulse::payload;
use pulse::policy::{BusinessPolicy, PolicyEventSchema, PolicyRegistry};
use pulse::store::{EncryptedStore, MemoryBackend};
use pulse::telemetry::FieldValue;
use std::sync::Arc;

fn registry() -> (PolicyRegistry, Arc<EncryptedStore>) {
    let store = Arc::new(EncryptedStore::in_memory());
    (PolicyRegistry::new(store.clone()), store)
}

fn custom_pricing() -> BusinessPolicy {
    BusinessPolicy {
        id: "POL_MARKET_PRICING".into(),
        name: "Customised pricing".into(),
        purpose: "Local override".into(),
        owner_team: "district-ops".into(),
        approved_at: Utc::now(),
        events: vec![PolicyEventSchema::new("PRICE_QUERY", &["commodity"])],
        max_events_per_hour: None,
    }
}

#[test]
fn seeding_is_idempotent() {
    let (registry, _) = registry();
    assert_eq!(registry.ensure_seeded().unwrap(), 4);
    assert_eq!(registry.ensure_seeded().unwrap(), 0);

    let ids: Vec<String> = registry.list_policies().into_iter().map(|p| p.id).collect();
    assert_eq!(
        ids,
        vec!["POL_MARKET_PRICING", "POL_SCHEME_DISCOVERY", "POL_CROP_ADVISORY", "POL_CALCULATOR_USAGE"]
    );
}

#[test]
fn seeding_does_not_overwrite_customised_policy() {
    let (registry, _) = registry();
    registry.register_policy(custom_pricing()).unwrap();

    assert_eq!(registry.ensure_seeded().unwrap(), 3);
    let pricing = registry.get_policy("POL_MARKET_PRICING").unwrap();
    assert_eq!(pricing.owner_team, "district-ops");
    assert_eq!(registry.list_policies().len(), 4);
}

#[test]
fn removed_seed_is_not_resurrected_across_restarts() {
    let backend = MemoryBackend::new();
    let first = PolicyRegistry::new(Arc::new(EncryptedStore::with_memory(backend.clone())));
    first.ensure_seeded().unwrap();
    assert!(first.remove_policy("POL_CALCULATOR_USAGE").unwrap());
    assert!(!first.remove_policy("POL_CALCULATOR_USAGE").unwrap());

    let second = PolicyRegistry::new(Arc::new(EncryptedStore::with_memory(backend)));
    assert_eq!(second.ensure_seeded().unwrap(), 0);
    assert!(second.get_policy("POL_CALCULATOR_USAGE").is_none());
}

#[test]
fn missing_required_field_is_reported() {
    let (registry, _) = registry();
    registry.ensure_seeded().unwrap();

    let result = registry.validate_event(
        "POL_MARKET_PRICING",
        "PRICE_QUERY",
        &payload! { "commodity" => "onion", "district" => "Nashik" },
    );
    assert!(!result.valid);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("queryCount"));
}

#[test]
fn falsy_values_satisfy_required_fields() {
    let (registry, _) = registry();
    registry.ensure_seeded().unwrap();

    let mut payload = payload! { "commodity" => "", "queryCount" => 0 };
    payload.insert("district".into(), FieldValue::Null);

    let result = registry.validate_event("POL_MARKET_PRICING", "PRICE_QUERY", &payload);
    assert!(result.valid, "{:?}", result.errors);
}

#[test]
fn undeclared_fields_only_warn() {
    let (registry, _) = registry();
    registry.ensure_seeded().unwrap();

    let result = registry.validate_event(
        "POL_CROP_ADVISORY",
        "ADVISORY_VIEWED",
        &payload! { "cropId" => "paddy", "district" => "Guntur", "gpsTrace" => "12.9,77.5" },
    );
    assert!(result.valid);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("gpsTrace"));
}

#[test]
fn unknown_policy_or_event_is_invalid() {
    let (registry, _) = registry();
    registry.ensure_seeded().unwrap();

    let unknown_policy = registry.validate_event("POL_NOPE", "PRICE_QUERY", &payload! {});
    assert!(!unknown_policy.valid);

    let undeclared_event = registry.validate_event("POL_MARKET_PRICING", "SCHEME_VIEWED", &payload! {});
    assert!(!undeclared_event.valid);
    assert!(undeclared_event.errors[0].contains("SCHEME_VIEWED"));
}

#[test]
fn policies_are_persisted_encrypted() {
    let backend = MemoryBackend::new();
    let registry = PolicyRegistry::new(Arc::new(EncryptedStore::with_memory(backend.clone())));
    registry.ensure_seeded().unwrap();

    let raw = backend.raw("policies").unwrap();
    assert!(raw.starts_with("pulse:v1:"));
    assert!(!raw.contains("POL_MARKET_PRICING"));
}
