//! TTL-bounded cache for reference datasets (scheme catalogs, mandi lists, ...).
//!
//! Each dataset lives in its own `dataset.<id>` slot. Expired records are
//! compacted away on every read, so a caller never sees a stale record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::store::{EncryptedStore, StoreError};
use crate::time::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetConfig {
    pub dataset_id: String,
    pub ttl_ms: u64,
}

impl DatasetConfig {
    pub fn new(dataset_id: impl Into<String>, ttl_ms: u64) -> Self {
        Self { dataset_id: dataset_id.into(), ttl_ms }
    }

    fn slot(&self) -> String {
        format!("dataset.{}", self.dataset_id)
    }

    fn ttl(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRecord {
    pub key: String,
    pub value: Map<String, Value>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DatasetRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

pub struct OfflineDatasetCache {
    store: Arc<EncryptedStore>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl OfflineDatasetCache {
    pub fn new(store: Arc<EncryptedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, write_lock: Mutex::new(()) }
    }

    /// Stores `value` under `key`, replacing any earlier record for that key.
    pub fn put(
        &self,
        config: &DatasetConfig,
        key: impl Into<String>,
        value: Map<String, Value>,
    ) -> Result<DatasetRecord, StoreError> {
        let _guard = self.lock();
        let now = self.clock.now();
        let record = DatasetRecord {
            key: key.into(),
            value,
            cached_at: now,
            expires_at: now.checked_add_signed(config.ttl()).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let mut records = self.load(config);
        records.retain(|r| r.is_live(now));
        match records.iter_mut().find(|r| r.key == record.key) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.store.write(&config.slot(), &records)?;
        Ok(record)
    }

    pub fn get(&self, config: &DatasetConfig, key: &str) -> Option<DatasetRecord> {
        self.live(config).into_iter().find(|r| r.key == key)
    }

    pub fn list(&self, config: &DatasetConfig) -> Vec<DatasetRecord> {
        self.live(config)
    }

    /// Discards expired records and persists the removal. Returns how many were removed.
    pub fn compact(&self, config: &DatasetConfig) -> Result<usize, StoreError> {
        let _guard = self.lock();
        let (live, removed) = self.partition(config);
        if removed > 0 {
            self.store.write(&config.slot(), &live)?;
            debug!(dataset = %config.dataset_id, removed, "compacted expired dataset records");
        }
        Ok(removed)
    }

    pub fn clear(&self, config: &DatasetConfig) -> Result<(), StoreError> {
        let _guard = self.lock();
        self.store.remove(&config.slot())
    }

    fn live(&self, config: &DatasetConfig) -> Vec<DatasetRecord> {
        let _guard = self.lock();
        let (live, removed) = self.partition(config);
        if removed > 0 {
            if let Err(e) = self.store.write(&config.slot(), &live) {
                warn!(dataset = %config.dataset_id, error = %e, "failed to persist dataset compaction");
            }
        }
        live
    }

    fn partition(&self, config: &DatasetConfig) -> (Vec<DatasetRecord>, usize) {
        let now = self.clock.now();
        let records = self.load(config);
        let before = records.len();
        let live: Vec<DatasetRecord> = records.into_iter().filter(|r| r.is_live(now)).collect();
        let removed = before - live.len();
        (live, removed)
    }

    fn load(&self, config: &DatasetConfig) -> Vec<DatasetRecord> {
        self.store.read(&config.slot(), Vec::new())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}
