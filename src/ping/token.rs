//! Signed wake and delivery tokens.
//!
//! Each token is signed with Ed25519 over a fixed canonical layout, never
//! over its serde encoding. All multi-byte integers in the signed layout are
//! big-endian. A ping's `ping_id` is the hex encoding of its nonce.

use crate::crypto::signature::{self, SigningKey, PUBLIC_KEY_SIZE};
use crate::crypto::random_array;
use crate::ack::AckKind;
use crate::error::{PqmsgError, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wake protocol version carried in every token.
pub const WAKE_PROTOCOL_VERSION: u8 = 1;

/// Size of ping and pong nonces.
pub const TOKEN_NONCE_SIZE: usize = 24;

/// Tolerated clock skew for tokens stamped in the future.
const MAX_FUTURE_SKEW_SECS: u64 = 60;

mod domain {
    pub const PING: &[u8] = b"pqmsg-ping-v1";
    pub const PONG: &[u8] = b"pqmsg-pong-v1";
    pub const ACK: &[u8] = b"pqmsg-ack-v1";
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn check_fresh(timestamp: u64, now: u64, max_age_secs: u64) -> Result<()> {
    if timestamp > now.saturating_add(MAX_FUTURE_SKEW_SECS) {
        return Err(PqmsgError::validation("Token timestamp is in the future"));
    }
    if now.saturating_sub(timestamp) > max_age_secs {
        return Err(PqmsgError::validation("Token expired"));
    }
    Ok(())
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| PqmsgError::serialization(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| PqmsgError::serialization(e.to_string()))
}

/// Wake signal from sender to recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingToken {
    pub protocol_version: u8,
    pub sender_pubkey: [u8; PUBLIC_KEY_SIZE],
    pub recipient_pubkey: [u8; PUBLIC_KEY_SIZE],
    pub nonce: [u8; TOKEN_NONCE_SIZE],
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

impl PingToken {
    /// Creates and signs a ping with a fresh nonce.
    pub fn new(sender: &SigningKey, recipient_pubkey: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self::with_nonce(sender, recipient_pubkey, random_array(), unix_now())
    }

    /// Creates and signs a ping with a fixed nonce and timestamp, so that a
    /// retried ping keeps its identity.
    pub fn with_nonce(
        sender: &SigningKey,
        recipient_pubkey: [u8; PUBLIC_KEY_SIZE],
        nonce: [u8; TOKEN_NONCE_SIZE],
        timestamp: u64,
    ) -> Self {
        let mut token = Self {
            protocol_version: WAKE_PROTOCOL_VERSION,
            sender_pubkey: sender.verifying_key().to_bytes(),
            recipient_pubkey,
            nonce,
            timestamp,
            signature: Vec::new(),
        };
        token.signature = signature::sign(sender, &token.signed_bytes()).to_vec();
        token
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(domain::PING.len() + 1 + 64 + TOKEN_NONCE_SIZE + 8);
        bytes.extend_from_slice(domain::PING);
        bytes.push(self.protocol_version);
        bytes.extend_from_slice(&self.sender_pubkey);
        bytes.extend_from_slice(&self.recipient_pubkey);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes
    }

    /// Identifier used as the ping inbox key.
    pub fn ping_id(&self) -> String {
        hex::encode(self.nonce)
    }

    /// Verifies the signature against the embedded sender key and that the
    /// token is addressed to `recipient_pubkey` and still fresh.
    pub fn verify(&self, recipient_pubkey: &[u8; PUBLIC_KEY_SIZE], max_age_secs: u64) -> Result<()> {
        self.verify_at(recipient_pubkey, max_age_secs, unix_now())
    }

    /// [`PingToken::verify`] against an explicit Unix time.
    pub fn verify_at(
        &self,
        recipient_pubkey: &[u8; PUBLIC_KEY_SIZE],
        max_age_secs: u64,
        now_secs: u64,
    ) -> Result<()> {
        if self.protocol_version != WAKE_PROTOCOL_VERSION {
            return Err(PqmsgError::validation(format!(
                "Unsupported wake protocol version {}",
                self.protocol_version
            )));
        }
        signature::verify(&self.sender_pubkey, &self.signed_bytes(), &self.signature)?;
        if !crate::crypto::TimingSafe::array_equal(&self.recipient_pubkey, recipient_pubkey) {
            return Err(PqmsgError::validation("Ping addressed to another recipient"));
        }
        check_fresh(self.timestamp, now_secs, max_age_secs)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Recipient's answer to a ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongToken {
    pub protocol_version: u8,
    pub ping_nonce: [u8; TOKEN_NONCE_SIZE],
    pub pong_nonce: [u8; TOKEN_NONCE_SIZE],
    pub timestamp: u64,
    /// Whether the recipient unlocked and is ready to receive
    pub authenticated: bool,
    pub signature: Vec<u8>,
}

impl PongToken {
    /// Creates and signs a pong answering `ping`.
    pub fn new(ping: &PingToken, recipient: &SigningKey, authenticated: bool) -> Self {
        let mut token = Self {
            protocol_version: ping.protocol_version,
            ping_nonce: ping.nonce,
            pong_nonce: random_array(),
            timestamp: unix_now(),
            authenticated,
            signature: Vec::new(),
        };
        token.signature = signature::sign(recipient, &token.signed_bytes()).to_vec();
        token
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(domain::PONG.len() + 2 + 2 * TOKEN_NONCE_SIZE + 8);
        bytes.extend_from_slice(domain::PONG);
        bytes.push(self.protocol_version);
        bytes.extend_from_slice(&self.ping_nonce);
        bytes.extend_from_slice(&self.pong_nonce);
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.push(self.authenticated as u8);
        bytes
    }

    /// The `ping_id` this pong answers.
    pub fn ping_id(&self) -> String {
        hex::encode(self.ping_nonce)
    }

    /// Verifies the signature under the recipient's key and freshness.
    pub fn verify(&self, signer_pubkey: &[u8], max_age_secs: u64) -> Result<()> {
        signature::verify(signer_pubkey, &self.signed_bytes(), &self.signature)?;
        check_fresh(self.timestamp, unix_now(), max_age_secs)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Signed confirmation that an item (ping, pong, message) was processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub item_id: String,
    pub kind: AckKind,
    pub timestamp: u64,
    /// Included in the signed bytes so the signer cannot be swapped
    pub sender_pubkey: [u8; PUBLIC_KEY_SIZE],
    pub signature: Vec<u8>,
}

impl DeliveryAck {
    /// Creates and signs an ACK.
    pub fn new(item_id: &str, kind: AckKind, sender: &SigningKey) -> Self {
        let mut ack = Self {
            item_id: item_id.to_string(),
            kind,
            timestamp: unix_now(),
            sender_pubkey: sender.verifying_key().to_bytes(),
            signature: Vec::new(),
        };
        ack.signature = signature::sign(sender, &ack.signed_bytes()).to_vec();
        ack
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(domain::ACK.len() + 4 + self.item_id.len() + 41);
        bytes.extend_from_slice(domain::ACK);
        bytes.extend_from_slice(&(self.item_id.len() as u32).to_be_bytes());
        bytes.extend_from_slice(self.item_id.as_bytes());
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.extend_from_slice(&self.sender_pubkey);
        bytes
    }

    /// Verifies the signature and that it came from `expected_sender`.
    pub fn verify(&self, expected_sender: &[u8; PUBLIC_KEY_SIZE], max_age_secs: u64) -> Result<()> {
        if !crate::crypto::TimingSafe::array_equal(&self.sender_pubkey, expected_sender) {
            return Err(PqmsgError::InvalidSignature);
        }
        signature::verify(&self.sender_pubkey, &self.signed_bytes(), &self.signature)?;
        check_fresh(self.timestamp, unix_now(), max_age_secs)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}
