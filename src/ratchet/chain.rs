//! Key types and derivation steps for the ratchet.
//!
//! Symmetric step, for a chain key `ck`:
//! - `next_chain_key = HMAC-SHA256(ck, 0x01)`
//! - `message_key    = HMAC-SHA256(ck, 0x02)`
//!
//! Chain keys for both directions are derived from the root:
//! - `outgoing = HMAC-SHA256(root, 0x03)`
//! - `incoming = HMAC-SHA256(root, 0x04)`

use crate::crypto::{HybridSharedSecret, TimingSafe};
use crate::error::{PqmsgError, Result};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Size of root keys in bytes.
pub const ROOT_KEY_SIZE: usize = 32;

/// Size of chain keys in bytes.
pub const CHAIN_KEY_SIZE: usize = 32;

/// Size of message keys in bytes.
pub const MESSAGE_KEY_SIZE: usize = 32;

const CHAIN_STEP: u8 = 0x01;
const MESSAGE_STEP: u8 = 0x02;
const OUTGOING_CHAIN: u8 = 0x03;
const INCOMING_CHAIN: u8 = 0x04;

/// HKDF labels.
mod kdf_info {
    pub const ROOT: &[u8] = b"pqmsg-ratchet-root-v1";
    pub const KEM_STEP: &[u8] = b"pqmsg-ratchet-kem-step-v1";
}

fn hmac_step(key: &[u8], label: u8) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| PqmsgError::key_length(CHAIN_KEY_SIZE, key.len()))?;
    mac.update(&[label]);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Root key of the KEM ratchet.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    key: [u8; ROOT_KEY_SIZE],
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl RootKey {
    /// Creates a root key from bytes.
    pub fn from_bytes(bytes: [u8; ROOT_KEY_SIZE]) -> Self {
        Self { key: bytes }
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; ROOT_KEY_SIZE] {
        &self.key
    }

    /// Derives the initial root from the hybrid agreement secret, salted with
    /// the identity context.
    pub fn from_hybrid_secret(secret: &HybridSharedSecret, context: &[u8; 32]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(context), secret.as_bytes());
        let mut key = [0u8; ROOT_KEY_SIZE];
        hk.expand(kdf_info::ROOT, &mut key)
            .map_err(|_| PqmsgError::kem("Root key derivation failed"))?;
        Ok(Self { key })
    }

    /// Mixes a KEM step secret into the root: `HKDF(salt = root, ikm = secret)`.
    pub fn mix(&self, secret: &HybridSharedSecret) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(&self.key), secret.as_bytes());
        let mut key = [0u8; ROOT_KEY_SIZE];
        hk.expand(kdf_info::KEM_STEP, &mut key)
            .map_err(|_| PqmsgError::kem("Root key derivation failed"))?;
        Ok(Self { key })
    }

    /// Derives the `(outgoing, incoming)` chain keys.
    pub fn derive_chains(&self) -> Result<(ChainKey, ChainKey)> {
        Ok((
            ChainKey::new(hmac_step(&self.key, OUTGOING_CHAIN)?),
            ChainKey::new(hmac_step(&self.key, INCOMING_CHAIN)?),
        ))
    }
}

/// A chain key used in the symmetric ratchet.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: [u8; CHAIN_KEY_SIZE],
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for ChainKey {
    fn eq(&self, other: &Self) -> bool {
        TimingSafe::array_equal(&self.key, &other.key)
    }
}

impl Eq for ChainKey {}

impl ChainKey {
    /// Creates a chain key from bytes.
    pub fn new(key: [u8; CHAIN_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; CHAIN_KEY_SIZE] {
        &self.key
    }

    /// One symmetric ratchet step, returning the next chain key and the
    /// message key for the current position.
    pub fn step(&self) -> Result<(ChainKey, MessageKey)> {
        let next = hmac_step(&self.key, CHAIN_STEP)?;
        let message = hmac_step(&self.key, MESSAGE_STEP)?;
        Ok((ChainKey::new(next), MessageKey::from_bytes(message)))
    }
}

/// A single-use message key.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey {
    key: [u8; MESSAGE_KEY_SIZE],
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl MessageKey {
    /// Creates a message key from bytes.
    pub fn from_bytes(bytes: [u8; MESSAGE_KEY_SIZE]) -> Self {
        Self { key: bytes }
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; MESSAGE_KEY_SIZE] {
        &self.key
    }
}
