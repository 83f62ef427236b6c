//! Slot encryption for the key-value store.
//!
//! Envelope layout: `pulse:v1:` + base64(nonce ‖ ciphertext ‖ tag).
//! The keystream is HMAC-SHA256(enc_key, nonce ‖ counter) and the tag is
//! HMAC-SHA256(mac_key, nonce ‖ ciphertext). Both keys are derived from the
//! store secret, so rotating the secret invalidates every envelope.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SECRET_LEN: usize = 32;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;
const BLOCK_LEN: usize = 32;

pub const ENVELOPE_PREFIX: &str = "pulse:v1:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("envelope is not valid base64")]
    Encoding,
    #[error("envelope is truncated")]
    Truncated,
    #[error("envelope failed authentication")]
    Tampered,
}

/// The store secret. Generated once, persisted unencrypted under the reserved slot.
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let bytes = STANDARD.decode(encoded.trim()).ok()?;
        let bytes: [u8; SECRET_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

pub struct SlotCipher {
    enc_key: [u8; BLOCK_LEN],
    mac_key: [u8; BLOCK_LEN],
}

impl SlotCipher {
    pub fn new(secret: &Secret) -> Self {
        Self {
            enc_key: derive(&secret.0, b"pulse.slot.enc"),
            mac_key: derive(&secret.0, b"pulse.slot.mac"),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut sealed = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(plaintext);
        self.apply_keystream(&nonce, &mut sealed[NONCE_LEN..]);

        let tag = self.tag(&sealed);
        sealed.extend_from_slice(&tag);
        format!("{ENVELOPE_PREFIX}{}", STANDARD.encode(sealed))
    }

    pub fn open(&self, envelope: &str) -> Result<Vec<u8>, CipherError> {
        let body = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or(CipherError::Encoding)?;
        let raw = STANDARD.decode(body).map_err(|_| CipherError::Encoding)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Truncated);
        }

        let (sealed, tag) = raw.split_at(raw.len() - TAG_LEN);
        let expected = self.tag(sealed);
        if !bool::from(expected[..].ct_eq(tag)) {
            return Err(CipherError::Tampered);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let mut plaintext = ciphertext.to_vec();
        self.apply_keystream(nonce, &mut plaintext);
        Ok(plaintext)
    }

    fn apply_keystream(&self, nonce: &[u8], data: &mut [u8]) {
        for (counter, chunk) in data.chunks_mut(BLOCK_LEN).enumerate() {
            let mut mac = keyed(&self.enc_key);
            mac.update(nonce);
            mac.update(&(counter as u64).to_be_bytes());
            let block = mac.finalize().into_bytes();
            for (byte, key) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key;
            }
        }
    }

    fn tag(&self, sealed: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = keyed(&self.mac_key);
        mac.update(sealed);
        to_array(&mac.finalize().into_bytes())
    }
}

fn keyed(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC can take key of any size")
}

fn derive(secret: &[u8], label: &[u8]) -> [u8; BLOCK_LEN] {
    let mut mac = keyed(secret);
    mac.update(label);
    to_array(&mac.finalize().into_bytes())
}

fn to_array(bytes: &[u8]) -> [u8; BLOCK_LEN] {
    let mut out = [0u8; BLOCK_LEN];
    out.copy_from_slice(&bytes[..BLOCK_LEN]);
    out
}
