//! Per-peer conversation facade.
//!
//! A [`Session`] wires the pieces of one conversation together:
//! - the PQ ratchet for encryption and periodic KEM re-keying
//! - the ack tracker, so retries resend the exact same bytes
//! - fixed-size padding on every packet
//! - the shared replay cache on inbound packets
//!
//! ## Packet layout
//!
//! ```text
//! padded( [message_number: u64 BE][ratchet ciphertext] )
//! ```
//!
//! The ratchet ciphertext carries its own version and generation header. The
//! plaintext inside is an [`Envelope`], so ACKs and KEM steps travel
//! encrypted and authenticated like ordinary messages.
//!
//! ## Lifecycle
//!
//! 1. Both sides establish a [`RatchetState`] from the hybrid agreement secret
//! 2. Each side sends [`Session::announce_kem_key`] once so the peer can step
//! 3. Messages flow with [`Session::send`] / [`Session::receive`]
//! 4. When [`Session::should_rekey`] fires, that side calls [`Session::rekey`]
//!
//! Only the side for which [`RatchetState::initiates_kem_steps`] holds ever
//! sends a KEM step. On the other side [`Session::rekey`] rotates the local
//! KEM key and sends it in a request, and the initiator steps toward it.
//!
//! Every envelope except an ACK is tracked until the peer acknowledges it;
//! [`Received::ack_id`] names what to acknowledge. A KEM step is a retry
//! barrier: while it is unacknowledged it is resent ahead of anything from
//! the generation it opens.
//!
//! A session is not internally synchronized. Callers keep one per peer behind
//! an exclusive lock and do not hold that lock across network I/O.

use crate::ack::{AckConfig, AckTracker, ChainPosition, RetryAction};
use crate::clock::SharedClock;
use crate::crypto::kem::HybridPublicKey;
use crate::crypto::{key_id_hex, random_array};
use crate::error::{PqmsgError, Result};
use crate::padding::PaddingConfig;
use crate::ratchet::{KemRatchetMessage, RatchetState};
use crate::replay::{Fingerprint, ReplayCache};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MESSAGE_NUMBER_SIZE: usize = 8;

/// Inbound packets remembered for re-acknowledgement
const OWED_ACK_CAPACITY: usize = 256;

/// Encrypted body of a session packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Application payload
    Data { message_id: String, body: Vec<u8> },
    /// Delivery confirmation for any other envelope
    Ack { message_id: String },
    /// Initiator moved to a new generation
    KemStep {
        message_id: String,
        step: KemRatchetMessage,
    },
    /// Sender's current KEM public key
    KemAnnounce {
        message_id: String,
        public: HybridPublicKey,
    },
    /// Responder rotated its KEM key and asks for a step toward it
    KemRequest {
        message_id: String,
        public: HybridPublicKey,
    },
}

impl Envelope {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| PqmsgError::serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| PqmsgError::serialization(e.to_string()))
    }

    /// Id the peer must acknowledge, if any.
    fn tracked_id(&self) -> Option<&str> {
        match self {
            Self::Data { message_id, .. }
            | Self::KemStep { message_id, .. }
            | Self::KemAnnounce { message_id, .. }
            | Self::KemRequest { message_id, .. } => Some(message_id),
            Self::Ack { .. } => None,
        }
    }
}

/// A packet ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub message_id: String,
    pub packet: Vec<u8>,
}

/// What an inbound packet turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Application payload
    Message { message_id: String, body: Vec<u8> },
    /// Peer confirmed delivery. `first` is false for duplicate ACKs.
    Acked { message_id: String, first: bool },
    /// Peer's KEM step was applied
    Rekeyed { message_id: String, generation: u32 },
    /// Peer's KEM public key was stored
    PeerKeyUpdated { message_id: String },
    /// Peer rotated its KEM key and wants a step; see [`Session::should_rekey`]
    RekeyRequested { message_id: String },
    /// Packet was already processed, but its ACK may have been lost
    Redelivered { message_id: String },
    /// Packet was already processed
    Duplicate,
}

impl Received {
    /// The id to pass to [`Session::acknowledge`], if this packet wants one.
    pub fn ack_id(&self) -> Option<&str> {
        match self {
            Self::Message { message_id, .. }
            | Self::Rekeyed { message_id, .. }
            | Self::PeerKeyUpdated { message_id }
            | Self::RekeyRequested { message_id }
            | Self::Redelivered { message_id } => Some(message_id),
            Self::Acked { .. } | Self::Duplicate => None,
        }
    }
}

fn new_message_id() -> String {
    hex::encode(random_array::<16>())
}

/// One peer conversation.
pub struct Session {
    ratchet: RatchetState,
    acks: AckTracker,
    padding: PaddingConfig,
    replay: Arc<ReplayCache>,
    clock: SharedClock,
    /// Unacknowledged KEM step (initiator)
    pending_step: Option<String>,
    /// Peer asked for a step (initiator)
    rekey_requested: bool,
    /// Unacknowledged KEM request (responder)
    pending_request: Option<String>,
    /// Generation a request was last sent in (responder)
    requested_generation: Option<u32>,
    owed_acks: LruCache<Fingerprint, String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("ratchet", &self.ratchet)
            .field("pending_acks", &self.acks.pending_count())
            .field("pending_step", &self.pending_step)
            .field("pending_request", &self.pending_request)
            .finish()
    }
}

impl Session {
    pub fn new(
        ratchet: RatchetState,
        ack_config: AckConfig,
        padding: PaddingConfig,
        replay: Arc<ReplayCache>,
        clock: SharedClock,
    ) -> Self {
        let capacity = NonZeroUsize::new(OWED_ACK_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            ratchet,
            acks: AckTracker::new(ack_config),
            padding,
            replay,
            clock,
            pending_step: None,
            rekey_requested: false,
            pending_request: None,
            requested_generation: None,
            owed_acks: LruCache::new(capacity),
        }
    }

    /// Current ratchet state, for persistence.
    pub fn ratchet(&self) -> &RatchetState {
        &self.ratchet
    }

    /// Pending delivery records.
    pub fn acks(&self) -> &AckTracker {
        &self.acks
    }

    pub fn padding(&self) -> &PaddingConfig {
        &self.padding
    }

    fn seal(&mut self, envelope: &Envelope) -> Result<(Vec<u8>, ChainPosition)> {
        let generation = self.ratchet.generation();
        let plaintext = zeroize::Zeroizing::new(envelope.to_bytes()?);
        let (ciphertext, message_number) = self.ratchet.encrypt(&plaintext)?;

        let mut framed = Vec::with_capacity(MESSAGE_NUMBER_SIZE + ciphertext.len());
        framed.extend_from_slice(&message_number.to_be_bytes());
        framed.extend_from_slice(&ciphertext);

        let packet = self.padding.pad(&framed)?;
        Ok((
            packet,
            ChainPosition {
                generation,
                message_number,
            },
        ))
    }

    /// Seals `envelope` and records it as pending until the peer ACKs.
    fn seal_tracked(&mut self, message_id: String, envelope: &Envelope) -> Result<OutboundPacket> {
        let (packet, position) = self.seal(envelope)?;
        self.acks
            .record_pending(&message_id, packet.clone(), position, self.clock.now_ms())?;
        Ok(OutboundPacket { message_id, packet })
    }

    /// Encrypts `body` and records it as pending until the peer ACKs.
    pub fn send(&mut self, body: &[u8]) -> Result<OutboundPacket> {
        let message_id = new_message_id();
        let envelope = Envelope::Data {
            message_id: message_id.clone(),
            body: body.to_vec(),
        };
        self.seal_tracked(message_id, &envelope)
    }

    /// Builds the ACK packet for a received envelope.
    pub fn acknowledge(&mut self, message_id: &str) -> Result<Vec<u8>> {
        let (packet, _) = self.seal(&Envelope::Ack {
            message_id: message_id.to_string(),
        })?;
        Ok(packet)
    }

    /// Builds a packet announcing our current KEM public key.
    pub fn announce_kem_key(&mut self) -> Result<OutboundPacket> {
        let message_id = new_message_id();
        let envelope = Envelope::KemAnnounce {
            message_id: message_id.clone(),
            public: self.ratchet.own_kem_public().clone(),
        };
        self.seal_tracked(message_id, &envelope)
    }

    /// Returns true when this side should call [`Session::rekey`].
    ///
    /// The initiator fires once the message interval elapsed or the peer
    /// asked, provided the peer's key is known and no step is in flight. The
    /// responder fires once per generation when its own interval elapsed.
    pub fn should_rekey(&self) -> bool {
        if self.ratchet.initiates_kem_steps() {
            self.ratchet.peer_kem_public().is_some()
                && self.pending_step.is_none()
                && (self.rekey_requested || self.ratchet.should_kem_ratchet())
        } else {
            self.ratchet.should_kem_ratchet()
                && self.pending_request.is_none()
                && self.requested_generation != Some(self.ratchet.generation())
        }
    }

    /// Moves the session toward a new generation.
    ///
    /// On the initiator this performs a KEM step. The packet is sealed under
    /// the old generation and everything sent after it uses the new one. On
    /// the responder it rotates the local KEM key and returns a request
    /// carrying the new public key.
    pub fn rekey(&mut self) -> Result<OutboundPacket> {
        if self.ratchet.initiates_kem_steps() {
            self.send_kem_step()
        } else {
            self.send_kem_request()
        }
    }

    fn send_kem_step(&mut self) -> Result<OutboundPacket> {
        if self.pending_step.is_some() {
            return Err(PqmsgError::invalid_state("KEM step already in flight"));
        }
        let peer_public = self
            .ratchet
            .peer_kem_public()
            .cloned()
            .ok_or_else(|| PqmsgError::invalid_state("Peer KEM key unknown"))?;

        let (step, prepared) = self.ratchet.prepare_kem_step(&peer_public)?;
        let message_id = new_message_id();
        let (packet, position) = self.seal(&Envelope::KemStep {
            message_id: message_id.clone(),
            step,
        })?;
        self.ratchet.commit_kem_step(prepared)?;
        self.acks
            .record_barrier(&message_id, packet.clone(), position, self.clock.now_ms())?;
        self.pending_step = Some(message_id.clone());
        self.rekey_requested = false;

        info!(
            peer = %self.ratchet.peer_identity(),
            generation = self.ratchet.generation(),
            "Session re-keyed"
        );
        Ok(OutboundPacket { message_id, packet })
    }

    fn send_kem_request(&mut self) -> Result<OutboundPacket> {
        let generation = self.ratchet.generation();
        if self.pending_request.is_some() || self.requested_generation == Some(generation) {
            return Err(PqmsgError::invalid_state(
                "KEM step already requested in this generation",
            ));
        }

        let public = self.ratchet.rotate_kem_keypair().clone();
        let message_id = new_message_id();
        let outbound = self.seal_tracked(
            message_id.clone(),
            &Envelope::KemRequest {
                message_id,
                public,
            },
        )?;
        self.pending_request = Some(outbound.message_id.clone());
        self.requested_generation = Some(generation);

        info!(
            peer = %self.ratchet.peer_identity(),
            generation,
            "Re-key requested"
        );
        Ok(outbound)
    }

    /// Processes one inbound packet.
    ///
    /// Undecryptable packets leave the session unchanged.
    pub fn receive(&mut self, packet: &[u8]) -> Result<Received> {
        let fingerprint = self
            .replay
            .fingerprint(self.ratchet.peer_identity().as_bytes(), packet);
        if self.replay.contains(&fingerprint) {
            if let Some(message_id) = self.owed_acks.get(&fingerprint) {
                debug!(message_id = %message_id, "Redelivered packet, ACK owed again");
                return Ok(Received::Redelivered {
                    message_id: message_id.clone(),
                });
            }
            warn!(peer = %self.ratchet.peer_identity(), "Replayed packet dropped");
            return Ok(Received::Duplicate);
        }

        let framed = self.padding.unpad(packet)?;
        if framed.len() < MESSAGE_NUMBER_SIZE {
            return Err(PqmsgError::validation("Packet too short"));
        }
        let (number_bytes, ciphertext) = framed.split_at(MESSAGE_NUMBER_SIZE);
        let mut number = [0u8; MESSAGE_NUMBER_SIZE];
        number.copy_from_slice(number_bytes);
        let message_number = u64::from_be_bytes(number);

        let plaintext = zeroize::Zeroizing::new(self.ratchet.decrypt(ciphertext, message_number)?);
        self.replay.check_and_insert(fingerprint);

        let envelope = Envelope::from_bytes(&plaintext)?;
        if let Some(message_id) = envelope.tracked_id() {
            self.owed_acks.put(fingerprint, message_id.to_string());
        }

        match envelope {
            Envelope::Data { message_id, body } => {
                debug!(message_id = %message_id, len = body.len(), "Message received");
                Ok(Received::Message { message_id, body })
            }
            Envelope::Ack { message_id } => {
                let first = self.acks.commit_ack(&message_id);
                if self.pending_step.as_deref() == Some(message_id.as_str()) {
                    self.pending_step = None;
                }
                if self.pending_request.as_deref() == Some(message_id.as_str()) {
                    self.pending_request = None;
                }
                Ok(Received::Acked { message_id, first })
            }
            Envelope::KemStep { message_id, step } => {
                if self.ratchet.initiates_kem_steps() {
                    return Err(PqmsgError::invalid_state(
                        "KEM step from a peer that does not initiate steps",
                    ));
                }
                self.ratchet.kem_ratchet_receive(&step)?;
                info!(
                    peer = %self.ratchet.peer_identity(),
                    generation = step.generation,
                    "Peer re-keyed"
                );
                Ok(Received::Rekeyed {
                    message_id,
                    generation: step.generation,
                })
            }
            Envelope::KemAnnounce { message_id, public } => {
                debug!(
                    peer = %self.ratchet.peer_identity(),
                    key_id = %key_id_hex(public.x25519_bytes()),
                    "Peer KEM key updated"
                );
                self.ratchet.set_peer_kem_public(public);
                Ok(Received::PeerKeyUpdated { message_id })
            }
            Envelope::KemRequest { message_id, public } => {
                if !self.ratchet.initiates_kem_steps() {
                    return Err(PqmsgError::invalid_state(
                        "KEM request sent to the responding side",
                    ));
                }
                info!(
                    peer = %self.ratchet.peer_identity(),
                    key_id = %key_id_hex(public.x25519_bytes()),
                    "Peer requested re-key"
                );
                self.ratchet.set_peer_kem_public(public);
                self.rekey_requested = true;
                Ok(Received::RekeyRequested { message_id })
            }
        }
    }

    /// Pending envelopes whose retry window elapsed, with their original
    /// packets, in chain order.
    pub fn due_for_retry(&mut self) -> Vec<RetryAction> {
        let now = self.clock.now_ms();
        self.acks.due_for_retry(now)
    }

    /// Drops delivery records that have been acknowledged.
    pub fn drain_acked(&mut self) -> Vec<String> {
        self.acks.drain_acked()
    }

    /// A cover packet the same size as a real one.
    pub fn cover_packet(&self) -> Vec<u8> {
        self.padding.cover_packet()
    }
}
