//! Two-phase delivery commit.
//!
//! Encryption advances the ratchet immediately, but anything that depends on
//! the peer actually having the message waits for its ACK:
//!
//! 1. [`AckTracker::record_pending`] stores the exact ratcheted bytes.
//! 2. [`AckTracker::commit_ack`] marks the record delivered.
//!
//! Retries resend the stored bytes unchanged and never re-encrypt, so a
//! resent message cannot desynchronize the peer's chain.
//!
//! A *barrier* record carries something the peer needs before it can read
//! later generations, such as a KEM step. While a barrier is unacknowledged
//! it is resent ahead of any due record from a later generation.

use crate::error::{PqmsgError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Default wait before a pending message is resent.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 30_000;

/// Default number of sends (first send included) before escalation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckConfig {
    /// Minimum time between two sends of the same message
    pub retry_interval_ms: u64,
    /// Sends allowed before the record is reported exhausted
    pub max_attempts: u32,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl AckConfig {
    /// Checks that the bounds are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PqmsgError::config("max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Position of a message in the sender's ratchet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPosition {
    pub generation: u32,
    pub message_number: u64,
}

/// One in-flight send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckCommitRecord {
    pub message_id: String,
    pub wire_bytes: Vec<u8>,
    pub position: ChainPosition,
    pub acked: bool,
    pub attempts: u32,
    pub last_sent_ms: u64,
    barrier: bool,
    exhausted: bool,
}

impl AckCommitRecord {
    fn retry_due(&self, now_ms: u64, interval_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_sent_ms) >= interval_ms
    }

    /// True if later generations depend on this record reaching the peer.
    pub fn is_barrier(&self) -> bool {
        self.barrier
    }
}

/// What the caller should do with a pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Send these bytes again
    Resend {
        message_id: String,
        wire_bytes: Vec<u8>,
        attempt: u32,
    },
    /// Give up automatic delivery and escalate through the ping layer
    Exhausted { message_id: String },
}

impl RetryAction {
    /// The error to surface for an exhausted record.
    pub fn as_error(&self) -> Option<PqmsgError> {
        match self {
            Self::Exhausted { message_id } => Some(PqmsgError::RetryExhausted(message_id.clone())),
            Self::Resend { .. } => None,
        }
    }
}

/// Tracks messages between send and delivery confirmation.
#[derive(Debug, Default)]
pub struct AckTracker {
    config: AckConfig,
    records: HashMap<String, AckCommitRecord>,
}

impl AckTracker {
    /// Creates an empty tracker.
    pub fn new(config: AckConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    /// Phase 1: remembers a sent message until it is acknowledged.
    ///
    /// Recording the same id with the same bytes again is a no-op. Reusing an
    /// id for different bytes is rejected.
    pub fn record_pending(
        &mut self,
        message_id: &str,
        wire_bytes: Vec<u8>,
        position: ChainPosition,
        now_ms: u64,
    ) -> Result<()> {
        self.insert(message_id, wire_bytes, position, now_ms, false)
    }

    /// Like [`AckTracker::record_pending`], for a record that later
    /// generations depend on.
    pub fn record_barrier(
        &mut self,
        message_id: &str,
        wire_bytes: Vec<u8>,
        position: ChainPosition,
        now_ms: u64,
    ) -> Result<()> {
        self.insert(message_id, wire_bytes, position, now_ms, true)
    }

    fn insert(
        &mut self,
        message_id: &str,
        wire_bytes: Vec<u8>,
        position: ChainPosition,
        now_ms: u64,
        barrier: bool,
    ) -> Result<()> {
        if let Some(existing) = self.records.get(message_id) {
            if existing.wire_bytes == wire_bytes {
                return Ok(());
            }
            return Err(PqmsgError::invalid_state(format!(
                "Message id {} already pending with different content",
                message_id
            )));
        }

        debug!(
            message_id,
            generation = position.generation,
            message_number = position.message_number,
            barrier,
            "Recorded pending message"
        );
        self.records.insert(
            message_id.to_string(),
            AckCommitRecord {
                message_id: message_id.to_string(),
                wire_bytes,
                position,
                acked: false,
                attempts: 1,
                last_sent_ms: now_ms,
                barrier,
                exhausted: false,
            },
        );
        Ok(())
    }

    /// Phase 2: marks `message_id` delivered.
    ///
    /// Returns true the first time, false for duplicate or unknown ACKs.
    pub fn commit_ack(&mut self, message_id: &str) -> bool {
        match self.records.get_mut(message_id) {
            Some(record) if !record.acked => {
                record.acked = true;
                info!(message_id, attempts = record.attempts, "Delivery confirmed");
                true
            }
            Some(_) => {
                debug!(message_id, "Duplicate ACK ignored");
                false
            }
            None => {
                debug!(message_id, "ACK for unknown message ignored");
                false
            }
        }
    }

    /// Returns the records whose retry window has elapsed, in chain order.
    ///
    /// Send the returned packets in the order given. An unacknowledged
    /// barrier is included whenever a record from a later generation is due,
    /// even if its own window has not elapsed. Each returned resend counts as
    /// an attempt. A record that has used up its attempts is reported once as
    /// [`RetryAction::Exhausted`].
    pub fn due_for_retry(&mut self, now_ms: u64) -> Vec<RetryAction> {
        let interval_ms = self.config.retry_interval_ms;
        let max_attempts = self.config.max_attempts;

        let mut open: Vec<&mut AckCommitRecord> = self
            .records
            .values_mut()
            .filter(|record| !record.acked && !record.exhausted)
            .collect();
        open.sort_by_key(|record| (record.position.generation, record.position.message_number));
        let newest_due = open
            .iter()
            .filter(|record| record.retry_due(now_ms, interval_ms))
            .map(|record| record.position.generation)
            .max();

        let mut actions = Vec::new();
        for record in open {
            let forced = record.barrier
                && newest_due.is_some_and(|generation| generation > record.position.generation);
            if !forced && !record.retry_due(now_ms, interval_ms) {
                continue;
            }

            if record.attempts >= max_attempts {
                record.exhausted = true;
                warn!(
                    message_id = %record.message_id,
                    attempts = record.attempts,
                    "Retries exhausted"
                );
                actions.push(RetryAction::Exhausted {
                    message_id: record.message_id.clone(),
                });
                continue;
            }

            record.attempts += 1;
            record.last_sent_ms = now_ms;
            actions.push(RetryAction::Resend {
                message_id: record.message_id.clone(),
                wire_bytes: record.wire_bytes.clone(),
                attempt: record.attempts,
            });
        }
        actions
    }

    /// Removes acknowledged records and returns their ids.
    pub fn drain_acked(&mut self) -> Vec<String> {
        let acked: Vec<String> = self
            .records
            .values()
            .filter(|r| r.acked)
            .map(|r| r.message_id.clone())
            .collect();
        for id in &acked {
            self.records.remove(id);
        }
        acked
    }

    /// Removes a record after manual resolution of an exhausted send.
    pub fn forget(&mut self, message_id: &str) -> Option<AckCommitRecord> {
        self.records.remove(message_id)
    }

    /// Looks up a record.
    pub fn get(&self, message_id: &str) -> Option<&AckCommitRecord> {
        self.records.get(message_id)
    }

    /// Returns true if `message_id` has been acknowledged.
    pub fn is_acked(&self, message_id: &str) -> bool {
        self.records.get(message_id).is_some_and(|r| r.acked)
    }

    /// Number of records still awaiting an ACK.
    pub fn pending_count(&self) -> usize {
        self.records.values().filter(|r| !r.acked).count()
    }
}

/// Handshake acknowledgement kinds, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AckKind {
    PingAck = 0,
    PongAck = 1,
    MessageAck = 2,
}

impl TryFrom<u8> for AckKind {
    type Error = PqmsgError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::PingAck),
            1 => Ok(Self::PongAck),
            2 => Ok(Self::MessageAck),
            other => Err(PqmsgError::validation(format!("Invalid ACK type: {}", other))),
        }
    }
}

/// Outcome of recording a handshake ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// First ACK of this kind, in order
    Accepted,
    /// First ACK of this kind, but an earlier kind never arrived
    ForwardProgress,
    /// Already recorded
    Duplicate,
}

/// Per-contact record of handshake ACKs.
///
/// Duplicates are idempotent. An ACK whose predecessor was lost is still
/// accepted so that circuit churn cannot wedge a contact.
#[derive(Debug, Default)]
pub struct HandshakeAcks {
    states: Mutex<HashMap<String, BTreeSet<AckKind>>>,
}

impl HandshakeAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `kind` for `contact_id`.
    pub fn record(&self, contact_id: &str, kind: AckKind) -> AckOutcome {
        let mut states = self.states.lock().unwrap();
        let seen = states.entry(contact_id.to_string()).or_default();

        if seen.contains(&kind) {
            debug!(contact_id, ?kind, "Duplicate handshake ACK");
            return AckOutcome::Duplicate;
        }

        let predecessor_missing = match kind {
            AckKind::PingAck => false,
            AckKind::PongAck => !seen.contains(&AckKind::PingAck),
            AckKind::MessageAck => !seen.contains(&AckKind::PongAck),
        };
        seen.insert(kind);

        if predecessor_missing {
            warn!(contact_id, ?kind, "Out-of-order handshake ACK allowed");
            AckOutcome::ForwardProgress
        } else {
            debug!(contact_id, ?kind, "Handshake ACK accepted");
            AckOutcome::Accepted
        }
    }

    /// Returns true if `kind` has been recorded for `contact_id`.
    pub fn has(&self, contact_id: &str, kind: AckKind) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(contact_id)
            .is_some_and(|seen| seen.contains(&kind))
    }

    /// Clears a contact's state after a completed exchange.
    pub fn reset(&self, contact_id: &str) {
        self.states.lock().unwrap().remove(contact_id);
    }
}
