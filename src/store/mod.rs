//! Encrypted, namespaced key-value persistence.
//!
//! Every slot except the reserved secret slot is written as an authenticated
//! envelope. Reads never fail: a missing, corrupt or undecryptable slot yields
//! the caller's fallback. Plaintext JSON left behind by older builds is read
//! as-is and re-written encrypted.

pub mod backend;
pub mod cipher;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
use cipher::{Secret, SlotCipher, ENVELOPE_PREFIX};

/// Reserved slot holding the store secret (unencrypted).
pub const SECRET_SLOT: &str = "__pulse.secret";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage i/o failed for slot `{slot}`: {source}")]
    Io {
        slot: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize value for slot `{slot}`: {source}")]
    Serialization {
        slot: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("slot `{0}` is reserved for the store secret")]
    ReservedKey(String),
}

pub struct EncryptedStore {
    backend: Box<dyn StorageBackend>,
    cipher: SlotCipher,
}

impl EncryptedStore {
    /// Opens a store over `backend`, loading the secret or generating it on first use.
    pub fn new(backend: Box<dyn StorageBackend>) -> Result<Self, StoreError> {
        let existing = backend.load(SECRET_SLOT).map_err(|source| StoreError::Io {
            slot: SECRET_SLOT.to_string(),
            source,
        })?;

        let secret = match existing.as_deref().map(Secret::decode) {
            Some(Some(secret)) => secret,
            found => {
                if found.is_some() {
                    warn!("store secret is malformed; generating a new one, existing slots will read as empty");
                }
                let secret = Secret::generate();
                backend
                    .save(SECRET_SLOT, &secret.encode())
                    .map_err(|source| StoreError::Io {
                        slot: SECRET_SLOT.to_string(),
                        source,
                    })?;
                secret
            }
        };

        Ok(Self {
            cipher: SlotCipher::new(&secret),
            backend,
        })
    }

    /// Non-durable store. Contents are lost when the process exits.
    pub fn in_memory() -> Self {
        Self::with_memory(MemoryBackend::new())
    }

    pub fn with_memory(backend: MemoryBackend) -> Self {
        let secret = match backend.raw(SECRET_SLOT).as_deref().and_then(Secret::decode) {
            Some(secret) => secret,
            None => {
                let secret = Secret::generate();
                backend.put_raw(SECRET_SLOT, &secret.encode());
                secret
            }
        };
        Self {
            cipher: SlotCipher::new(&secret),
            backend: Box::new(backend),
        }
    }

    /// Opens a directory-backed store, degrading to memory if the directory is unusable.
    pub fn open_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let opened = FileBackend::open(dir)
            .map_err(|source| StoreError::Io {
                slot: dir.display().to_string(),
                source,
            })
            .and_then(|backend| Self::new(Box::new(backend)));

        match opened {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %e, "durable store unavailable; falling back to memory, data will not survive restart");
                Self::in_memory()
            }
        }
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_durable()
    }

    pub fn read<V: DeserializeOwned>(&self, slot: &str, fallback: V) -> V {
        let raw = match self.backend.load(slot) {
            Ok(Some(raw)) => raw,
            Ok(None) => return fallback,
            Err(e) => {
                warn!(slot, error = %e, "slot read failed; using fallback");
                return fallback;
            }
        };

        if raw.starts_with(ENVELOPE_PREFIX) {
            let plaintext = match self.cipher.open(&raw) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(slot, error = %e, "slot could not be decrypted; using fallback");
                    return fallback;
                }
            };
            return match serde_json::from_slice(&plaintext) {
                Ok(value) => value,
                Err(e) => {
                    warn!(slot, error = %e, "slot holds malformed json; using fallback");
                    fallback
                }
            };
        }

        // Legacy plaintext slot.
        match serde_json::from_str(&raw) {
            Ok(value) => {
                let upgraded = self.cipher.seal(raw.as_bytes());
                match self.backend.save(slot, &upgraded) {
                    Ok(()) => debug!(slot, "upgraded plaintext slot to encrypted envelope"),
                    Err(e) => warn!(slot, error = %e, "failed to upgrade plaintext slot"),
                }
                value
            }
            Err(e) => {
                warn!(slot, error = %e, "slot holds malformed json; using fallback");
                fallback
            }
        }
    }

    pub fn write<V: Serialize + ?Sized>(&self, slot: &str, value: &V) -> Result<(), StoreError> {
        guard_reserved(slot)?;
        let json = serde_json::to_vec(value).map_err(|source| StoreError::Serialization {
            slot: slot.to_string(),
            source,
        })?;
        self.backend
            .save(slot, &self.cipher.seal(&json))
            .map_err(|source| StoreError::Io {
                slot: slot.to_string(),
                source,
            })
    }

    pub fn remove(&self, slot: &str) -> Result<(), StoreError> {
        guard_reserved(slot)?;
        self.backend.delete(slot).map_err(|source| StoreError::Io {
            slot: slot.to_string(),
            source,
        })
    }
}

fn guard_reserved(slot: &str) -> Result<(), StoreError> {
    if slot == SECRET_SLOT {
        return Err(StoreError::ReservedKey(slot.to_string()));
    }
    Ok(())
}
