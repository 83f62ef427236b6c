use pulse::store::{EncryptedStore, MemoryBackend, StoreError, SECRET_SLOT};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Mandi {
    name: String,
    district: String,
}

fn unique_dir(suffix: &str) -> PathBuf {
    env::temp_dir().join(format!("pulse-store-{suffix}-{}", Uuid::new_v4()))
}

#[test]
fn written_values_are_encrypted_at_rest() {
    let backend = MemoryBackend::new();
    let store = EncryptedStore::with_memory(backend.clone());
    let mandi = Mandi { name: "Kumbakonam".into(), district: "Thanjavur".into() };

    store.write("mandis", &vec![mandi.clone()]).unwrap();

    let raw = backend.raw("mandis").expect("slot written");
    assert!(raw.starts_with("pulse:v1:"));
    assert!(!raw.contains("Kumbakonam"), "plaintext must not be stored");
    assert_eq!(store.read("mandis", Vec::<Mandi>::new()), vec![mandi]);

    // Secret is generated once and stored unencrypted.
    let secret = backend.raw(SECRET_SLOT).expect("secret persisted");
    assert!(!secret.starts_with("pulse:v1:"));
}

#[test]
fn legacy_plaintext_is_read_and_upgraded() {
    let backend = MemoryBackend::new();
    backend.put_raw("policies.legacy", r#"[{"name":"Old","district":"Madurai"}]"#);
    let store = EncryptedStore::with_memory(backend.clone());

    let read: Vec<Mandi> = store.read("policies.legacy", Vec::new());
    assert_eq!(read, vec![Mandi { name: "Old".into(), district: "Madurai".into() }]);

    let raw = backend.raw("policies.legacy").unwrap();
    assert!(raw.starts_with("pulse:v1:"), "slot should be re-written encrypted");
    assert_eq!(store.read("policies.legacy", Vec::<Mandi>::new()), read);
}

#[test]
fn corrupt_or_malformed_slots_return_fallback() {
    let backend = MemoryBackend::new();
    let store = EncryptedStore::with_memory(backend.clone());

    backend.put_raw("garbled", "pulse:v1:bm90IGEgcmVhbCBlbnZlbG9wZSBhdCBhbGwsIGp1c3QgdGV4dA==");
    assert_eq!(store.read("garbled", 7u32), 7);

    backend.put_raw("broken-json", "{not json");
    assert_eq!(store.read("broken-json", vec![1, 2]), vec![1, 2]);

    assert_eq!(store.read("missing", String::from("fallback")), "fallback");
}

#[test]
fn envelope_from_another_secret_reads_as_fallback() {
    let a = MemoryBackend::new();
    let store_a = EncryptedStore::with_memory(a.clone());
    store_a.write("counter", &41u32).unwrap();

    let b = MemoryBackend::new();
    b.put_raw("counter", &a.raw("counter").unwrap());
    let store_b = EncryptedStore::with_memory(b);
    assert_eq!(store_b.read("counter", 0u32), 0);
}

#[test]
fn reserved_secret_slot_cannot_be_overwritten() {
    let store = EncryptedStore::in_memory();
    assert!(matches!(store.write(SECRET_SLOT, &"x"), Err(StoreError::ReservedKey(_))));
    assert!(matches!(store.remove(SECRET_SLOT), Err(StoreError::ReservedKey(_))));
}

#[test]
fn remove_clears_slot() {
    let store = EncryptedStore::in_memory();
    store.write("dataset.prices", &vec!["a"]).unwrap();
    store.remove("dataset.prices").unwrap();
    assert!(store.read("dataset.prices", Vec::<String>::new()).is_empty());
}

#[test]
fn directory_store_survives_reopen() {
    let dir = unique_dir("reopen");
    {
        let store = EncryptedStore::open_dir(&dir);
        assert!(store.is_durable());
        store.write("feature.specs", &vec!["price-alerts"]).unwrap();
    }

    let reopened = EncryptedStore::open_dir(&dir);
    assert_eq!(reopened.read("feature.specs", Vec::<String>::new()), vec!["price-alerts".to_string()]);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unusable_directory_degrades_to_memory() {
    let blocker = unique_dir("blocker");
    fs::write(&blocker, "i am a file").unwrap();

    let store = EncryptedStore::open_dir(blocker.join("nested"));
    assert!(!store.is_durable());
    store.write("still-works", &true).unwrap();
    assert!(store.read("still-works", false));
    let _ = fs::remove_file(&blocker);
}
