//! Inbound side of the wake handshake.
//!
//! [`WakeHandler`] verifies and rate-limits signed pings, records them in the
//! inbox, answers with pongs and emits the delivery ACK once the payload is
//! stored. Every inbox transition goes through the conditional primitives,
//! so a handler racing another worker on the same ping simply loses with
//! [`PqmsgError::ClaimLost`].

use super::{require_row, FailureOutcome, InsertOutcome, PingConfig, PingInbox};
use super::token::{DeliveryAck, PingToken, PongToken};
use crate::ack::{AckKind, AckOutcome, HandshakeAcks};
use crate::clock::SharedClock;
use crate::crypto::signature::{SigningKey, PUBLIC_KEY_SIZE};
use crate::error::{PqmsgError, Result};
use crate::validation::{RateLimit, RateLimiter, Validator};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of accepting an inbound ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPing {
    pub ping_id: String,
    pub outcome: InsertOutcome,
}

/// Verifies and records wake signals addressed to the local identity.
pub struct WakeHandler {
    inbox: Arc<dyn PingInbox>,
    identity: SigningKey,
    limiter: RateLimiter,
    acks: HandshakeAcks,
    config: PingConfig,
    clock: SharedClock,
}

impl WakeHandler {
    pub fn new(
        inbox: Arc<dyn PingInbox>,
        identity: SigningKey,
        config: PingConfig,
        clock: SharedClock,
    ) -> Self {
        Self::with_rate_limit(inbox, identity, config, RateLimit::inbound_ping_default(), clock)
    }

    pub fn with_rate_limit(
        inbox: Arc<dyn PingInbox>,
        identity: SigningKey,
        config: PingConfig,
        rate_limit: RateLimit,
        clock: SharedClock,
    ) -> Self {
        Self {
            inbox,
            identity,
            limiter: RateLimiter::new(rate_limit, clock.clone()),
            acks: HandshakeAcks::new(),
            config,
            clock,
        }
    }

    /// Our Ed25519 public key, as pings must address it.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.identity.verifying_key().to_bytes()
    }

    pub fn inbox(&self) -> &Arc<dyn PingInbox> {
        &self.inbox
    }

    /// Validates a ping from `contact_id` and records it idempotently.
    ///
    /// `expected_sender` is the contact's known signing key.
    pub fn on_ping(
        &self,
        contact_id: &str,
        expected_sender: &[u8; PUBLIC_KEY_SIZE],
        token_bytes: &[u8],
    ) -> Result<InboundPing> {
        Validator::validate_contact_id(contact_id)?;
        Validator::validate_token_size(token_bytes)?;
        self.limiter.check_rate_limit(contact_id)?;

        let token = PingToken::from_bytes(token_bytes)?;
        token.verify(&self.public_key(), self.config.token_max_age_secs)?;
        if !crate::crypto::TimingSafe::array_equal(&token.sender_pubkey, expected_sender) {
            return Err(PqmsgError::InvalidSignature);
        }

        let ping_id = token.ping_id();
        let outcome = self.inbox.insert_or_touch(
            &ping_id,
            contact_id,
            Some(token_bytes.to_vec()),
            self.clock.now_ms(),
        )?;
        if outcome == InsertOutcome::Inserted {
            self.acks.record(contact_id, AckKind::PingAck);
        }
        Ok(InboundPing { ping_id, outcome })
    }

    /// Answers a recorded ping and moves it to `PongSent`.
    pub fn send_pong(&self, ping_id: &str, authenticated: bool) -> Result<PongToken> {
        let entry = self
            .inbox
            .get(ping_id)?
            .ok_or_else(|| PqmsgError::ClaimLost(ping_id.to_string()))?;
        let token_bytes = entry
            .wire_bytes
            .as_deref()
            .ok_or_else(|| PqmsgError::invalid_state("Ping entry has no cached token"))?;
        let ping = PingToken::from_bytes(token_bytes)?;

        require_row(
            self.inbox.mark_pong_sent(ping_id, self.clock.now_ms())?,
            ping_id,
        )?;
        self.acks.record(&entry.contact_id, AckKind::PongAck);
        debug!(ping_id, authenticated, "Pong sent");
        Ok(PongToken::new(&ping, &self.identity, authenticated))
    }

    /// Marks the payload stored and returns the signed delivery ACK.
    pub fn complete_download(&self, ping_id: &str) -> Result<DeliveryAck> {
        require_row(self.inbox.mark_stored(ping_id, self.clock.now_ms())?, ping_id)?;
        info!(ping_id, "Download complete");
        Ok(DeliveryAck::new(ping_id, AckKind::MessageAck, &self.identity))
    }

    /// Records a failed download attempt.
    pub fn fail_download(&self, ping_id: &str) -> Result<FailureOutcome> {
        self.inbox
            .record_failure(ping_id, self.config.max_retries, self.clock.now_ms())
    }

    /// Verifies a delivery ACK from `contact_id` and records its kind.
    pub fn on_delivery_ack(
        &self,
        contact_id: &str,
        expected_sender: &[u8; PUBLIC_KEY_SIZE],
        ack_bytes: &[u8],
    ) -> Result<(DeliveryAck, AckOutcome)> {
        Validator::validate_token_size(ack_bytes)?;
        let ack = DeliveryAck::from_bytes(ack_bytes)?;
        ack.verify(expected_sender, self.config.token_max_age_secs)?;
        let outcome = self.acks.record(contact_id, ack.kind);
        if ack.kind == AckKind::MessageAck {
            self.acks.reset(contact_id);
        }
        Ok((ack, outcome))
    }
}
