//! Post-quantum double ratchet.
//!
//! A [`RatchetState`] holds one conversation's keys. It combines two ratchets:
//!
//! ### Symmetric ratchet
//!
//! Every message advances a chain key by one HMAC step and uses the derived
//! message key exactly once. The previous chain key is dropped (and zeroized)
//! immediately, so compromising the current state does not expose earlier
//! messages.
//!
//! ### KEM ratchet
//!
//! Periodically one side encapsulates a fresh hybrid (X25519 + ML-KEM-1024)
//! secret to the peer's current public key and mixes it into the root key.
//! Both chains are re-derived from the new root and the generation counter
//! is incremented. This heals the session after a state compromise.
//!
//! Steps must not cross. [`RatchetState::initiates_kem_steps`] names the one
//! side that starts them; the other side rotates its own KEM key with
//! [`RatchetState::rotate_kem_keypair`] and asks. The key pair it replaced is
//! kept until a step for the new key arrives, so a step already in flight
//! still decapsulates.
//!
//! ## Wire format
//!
//! ```text
//! [version: 1][generation: 4 BE][nonce: 24][ciphertext || tag]
//! ```
//!
//! The message number travels next to the ciphertext in the caller's framing
//! and is bound into the AEAD associated data together with the version,
//! the generation and a digest of both identities.
//!
//! ## Ordering
//!
//! Messages may arrive out of order. Keys for skipped positions are cached,
//! keyed by `(generation, message_number)`, up to a fixed bound. The
//! receiving chain of the previous generation is retained until the next KEM
//! step so that messages sent before the peer observed a step still decrypt.
//!
//! Every decrypt path is all-or-nothing: a failure leaves the state exactly
//! as it was.

pub mod chain;

use crate::crypto::kem::X25519_KEY_SIZE;
use crate::crypto::{
    aead_decrypt, aead_encrypt, hybrid_decapsulate, hybrid_encapsulate, HybridCiphertext,
    HybridKeyPair, HybridPublicKey, HybridSharedSecret, AEAD_OVERHEAD, HYBRID_SECRET_SIZE,
};
use crate::error::{PqmsgError, Result};
use crate::validation::Validator;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, trace};
use zeroize::Zeroizing;

pub use chain::{ChainKey, MessageKey, RootKey};

/// Version byte at the start of every ratchet ciphertext.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the ciphertext header (version + generation).
pub const HEADER_SIZE: usize = 5;

/// Maximum number of chain steps a single decrypt may skip ahead.
pub const DEFAULT_MAX_SKIP: u64 = 256;

/// Maximum number of cached skipped message keys.
pub const DEFAULT_MAX_SKIPPED_KEYS: usize = 256;

/// Number of sent messages after which a KEM step is due.
pub const DEFAULT_KEM_INTERVAL: u64 = 50;

const IDENTITY_CONTEXT_LABEL: &[u8] = b"pqmsg-identity-context-v1";

/// Ratchet tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetConfig {
    /// Largest gap a single decrypt will step across
    pub max_skip: u64,
    /// Bound on cached skipped keys; the oldest positions are evicted first
    pub max_skipped_keys: usize,
    /// Sent messages per generation before [`RatchetState::should_kem_ratchet`] fires
    pub kem_interval: u64,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skip: DEFAULT_MAX_SKIP,
            max_skipped_keys: DEFAULT_MAX_SKIPPED_KEYS,
            kem_interval: DEFAULT_KEM_INTERVAL,
        }
    }
}

impl RatchetConfig {
    /// Checks that the bounds are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_skip == 0 || self.max_skipped_keys == 0 {
            return Err(PqmsgError::config("Skip bounds must be non-zero"));
        }
        if self.kem_interval == 0 {
            return Err(PqmsgError::config("KEM interval must be non-zero"));
        }
        Ok(())
    }
}

/// Sent to the peer after a local KEM step. Must travel inside an
/// authenticated ratchet message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemRatchetMessage {
    /// Hybrid ciphertext for the peer's current KEM key
    pub ciphertext: HybridCiphertext,
    /// X25519 half of the key the ciphertext was made for
    pub recipient_key: [u8; X25519_KEY_SIZE],
    /// Generation the sender moved to
    pub generation: u32,
    /// Sender's fresh public key for the next step in the other direction
    pub sender_public: HybridPublicKey,
}

impl KemRatchetMessage {
    /// Encodes the message for transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| PqmsgError::serialization(e.to_string()))
    }

    /// Decodes a message produced by [`KemRatchetMessage::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| PqmsgError::serialization(e.to_string()))
    }
}

/// A locally prepared KEM step awaiting [`RatchetState::commit_kem_step`].
pub struct PreparedKemStep {
    secret: HybridSharedSecret,
    keypair: HybridKeyPair,
    peer_public: HybridPublicKey,
    generation: u32,
}

impl fmt::Debug for PreparedKemStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedKemStep")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Receiving chain of the generation before the current one.
#[derive(Clone, Serialize, Deserialize)]
struct PreviousChain {
    generation: u32,
    chain: ChainKey,
    next_number: u64,
}

/// Result of stepping a receiving chain on a scratch copy.
struct Advanced {
    chain: ChainKey,
    skipped: Vec<(u64, MessageKey)>,
    plaintext: Vec<u8>,
}

/// Digest of both identities in sorted order, and whether `local` sorts first.
fn identity_context(local: &str, peer: &str) -> ([u8; 32], bool) {
    let local_first = local.as_bytes() < peer.as_bytes();
    let (first, second) = if local_first {
        (local, peer)
    } else {
        (peer, local)
    };

    let mut hasher = Sha256::new();
    hasher.update(IDENTITY_CONTEXT_LABEL);
    hasher.update((first.len() as u64).to_be_bytes());
    hasher.update(first.as_bytes());
    hasher.update((second.len() as u64).to_be_bytes());
    hasher.update(second.as_bytes());

    let mut context = [0u8; 32];
    context.copy_from_slice(&hasher.finalize());
    (context, local_first)
}

fn parse_header(ciphertext: &[u8]) -> Result<(u32, &[u8])> {
    if ciphertext.len() < HEADER_SIZE + AEAD_OVERHEAD || ciphertext[0] != PROTOCOL_VERSION {
        return Err(PqmsgError::DecryptionFailed);
    }
    let generation_bytes: [u8; 4] = ciphertext[1..HEADER_SIZE]
        .try_into()
        .map_err(|_| PqmsgError::DecryptionFailed)?;
    Ok((u32::from_be_bytes(generation_bytes), &ciphertext[HEADER_SIZE..]))
}

/// Complete state for one conversation peer.
///
/// Not internally synchronized: callers hold one exclusive lock per peer.
#[derive(Serialize, Deserialize)]
pub struct RatchetState {
    root_key: RootKey,
    sending_chain_key: ChainKey,
    receiving_chain_key: ChainKey,
    sending_message_number: u64,
    receiving_message_number: u64,
    previous_receiving_chain: Option<PreviousChain>,
    skipped_message_keys: BTreeMap<(u32, u64), MessageKey>,
    own_kem_keypair: HybridKeyPair,
    retired_kem_keypair: Option<HybridKeyPair>,
    peer_kem_public_key: Option<HybridPublicKey>,
    local_identity: String,
    peer_identity: String,
    context: [u8; 32],
    sends_outgoing: bool,
    generation: u32,
    config: RatchetConfig,
}

impl fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetState")
            .field("peer", &self.peer_identity)
            .field("generation", &self.generation)
            .field("send_count", &self.sending_message_number)
            .field("recv_count", &self.receiving_message_number)
            .field("skipped_keys_count", &self.skipped_message_keys.len())
            .field("has_peer_kem_key", &self.peer_kem_public_key.is_some())
            .finish()
    }
}

impl RatchetState {
    /// Establishes a session from a 64-byte hybrid agreement secret.
    pub fn establish(hybrid_secret: &[u8], local_identity: &str, peer_identity: &str) -> Result<Self> {
        Self::establish_with_config(
            hybrid_secret,
            local_identity,
            peer_identity,
            RatchetConfig::default(),
        )
    }

    /// Establishes a session with explicit ratchet tuning.
    pub fn establish_with_config(
        hybrid_secret: &[u8],
        local_identity: &str,
        peer_identity: &str,
        config: RatchetConfig,
    ) -> Result<Self> {
        config.validate()?;
        let secret_bytes: [u8; HYBRID_SECRET_SIZE] = hybrid_secret
            .try_into()
            .map_err(|_| PqmsgError::key_length(HYBRID_SECRET_SIZE, hybrid_secret.len()))?;
        let secret = HybridSharedSecret::from_bytes(secret_bytes);

        Validator::validate_identity(local_identity)?;
        Validator::validate_identity(peer_identity)?;
        if local_identity == peer_identity {
            return Err(PqmsgError::validation(
                "Local and peer identity must differ",
            ));
        }

        let (context, sends_outgoing) = identity_context(local_identity, peer_identity);
        let root_key = RootKey::from_hybrid_secret(&secret, &context)?;
        let (sending_chain_key, receiving_chain_key) = Self::assign_chains(&root_key, sends_outgoing)?;

        debug!(
            peer = %peer_identity,
            sends_outgoing,
            "Ratchet established"
        );

        Ok(Self {
            root_key,
            sending_chain_key,
            receiving_chain_key,
            sending_message_number: 0,
            receiving_message_number: 0,
            previous_receiving_chain: None,
            skipped_message_keys: BTreeMap::new(),
            own_kem_keypair: HybridKeyPair::generate(),
            retired_kem_keypair: None,
            peer_kem_public_key: None,
            local_identity: local_identity.to_string(),
            peer_identity: peer_identity.to_string(),
            context,
            sends_outgoing,
            generation: 0,
            config,
        })
    }

    fn assign_chains(root: &RootKey, sends_outgoing: bool) -> Result<(ChainKey, ChainKey)> {
        let (outgoing, incoming) = root.derive_chains()?;
        Ok(if sends_outgoing {
            (outgoing, incoming)
        } else {
            (incoming, outgoing)
        })
    }

    fn associated_data(&self, generation: u32, message_number: u64) -> [u8; 45] {
        let mut ad = [0u8; 45];
        ad[0] = PROTOCOL_VERSION;
        ad[1..5].copy_from_slice(&generation.to_be_bytes());
        ad[5..13].copy_from_slice(&message_number.to_be_bytes());
        ad[13..].copy_from_slice(&self.context);
        ad
    }

    /// Encrypts `plaintext` with the next sending key.
    ///
    /// Returns the ciphertext and the message number it was sent under.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Vec<u8>, u64)> {
        if self.sending_message_number == u64::MAX {
            return Err(PqmsgError::KemStepRequired);
        }

        let message_number = self.sending_message_number;
        let (next_chain, message_key) = self.sending_chain_key.step()?;
        let ad = self.associated_data(self.generation, message_number);
        let sealed = aead_encrypt(message_key.as_bytes(), plaintext, &ad)?;

        self.sending_chain_key = next_chain;
        self.sending_message_number += 1;

        let mut out = Vec::with_capacity(HEADER_SIZE + sealed.len());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&self.generation.to_be_bytes());
        out.extend_from_slice(&sealed);

        trace!(
            generation = self.generation,
            message_number,
            "Encrypted message"
        );
        Ok((out, message_number))
    }

    /// Decrypts a ciphertext sent under `message_number`.
    pub fn decrypt(&mut self, ciphertext: &[u8], message_number: u64) -> Result<Vec<u8>> {
        let (generation, sealed) = parse_header(ciphertext)?;
        if generation > self.generation {
            return Err(PqmsgError::invalid_state(format!(
                "Message from generation {} ahead of local generation {}",
                generation, self.generation
            )));
        }
        let ad = self.associated_data(generation, message_number);

        if let Some(key) = self.skipped_message_keys.get(&(generation, message_number)) {
            let plaintext = aead_decrypt(key.as_bytes(), sealed, &ad)?;
            self.skipped_message_keys.remove(&(generation, message_number));
            trace!(generation, message_number, "Decrypted with skipped key");
            return Ok(plaintext);
        }

        if generation == self.generation {
            let advanced = self.advance(
                &self.receiving_chain_key,
                self.receiving_message_number,
                generation,
                message_number,
                sealed,
                &ad,
            )?;
            self.receiving_chain_key = advanced.chain;
            self.receiving_message_number = message_number.saturating_add(1);
            self.store_skipped(generation, advanced.skipped);
            trace!(generation, message_number, "Decrypted message");
            return Ok(advanced.plaintext);
        }

        let previous = match &self.previous_receiving_chain {
            Some(previous) if previous.generation == generation => previous,
            _ => {
                return Err(PqmsgError::DuplicateOrExpiredMessage {
                    generation,
                    message_number,
                })
            }
        };
        let advanced = self.advance(
            &previous.chain,
            previous.next_number,
            generation,
            message_number,
            sealed,
            &ad,
        )?;
        self.previous_receiving_chain = Some(PreviousChain {
            generation,
            chain: advanced.chain,
            next_number: message_number.saturating_add(1),
        });
        self.store_skipped(generation, advanced.skipped);
        trace!(generation, message_number, "Decrypted message from previous generation");
        Ok(advanced.plaintext)
    }

    /// Steps a scratch copy of `chain` up to `message_number` and decrypts.
    fn advance(
        &self,
        chain: &ChainKey,
        next_number: u64,
        generation: u32,
        message_number: u64,
        sealed: &[u8],
        ad: &[u8],
    ) -> Result<Advanced> {
        if message_number < next_number {
            return Err(PqmsgError::DuplicateOrExpiredMessage {
                generation,
                message_number,
            });
        }
        let gap = message_number - next_number;
        if gap > self.config.max_skip {
            return Err(PqmsgError::SkipLimitExceeded {
                gap,
                limit: self.config.max_skip,
            });
        }

        let mut chain = chain.clone();
        let mut skipped = Vec::with_capacity(gap as usize);
        for position in next_number..message_number {
            let (next, key) = chain.step()?;
            skipped.push((position, key));
            chain = next;
        }
        let (next, key) = chain.step()?;
        let plaintext = aead_decrypt(key.as_bytes(), sealed, ad)?;

        Ok(Advanced {
            chain: next,
            skipped,
            plaintext,
        })
    }

    fn store_skipped(&mut self, generation: u32, skipped: Vec<(u64, MessageKey)>) {
        if skipped.is_empty() {
            return;
        }
        trace!(generation, count = skipped.len(), "Caching skipped message keys");
        for (position, key) in skipped {
            self.skipped_message_keys.insert((generation, position), key);
        }
        while self.skipped_message_keys.len() > self.config.max_skipped_keys {
            if let Some(((evicted_generation, evicted_number), _)) =
                self.skipped_message_keys.pop_first()
            {
                debug!(
                    generation = evicted_generation,
                    message_number = evicted_number,
                    "Evicted skipped message key"
                );
            }
        }
    }

    /// Performs a local KEM ratchet step toward `peer_kem_public`.
    ///
    /// Generates a fresh own key pair, mixes the encapsulated secret into the
    /// root and re-derives both chains. The returned message must reach the
    /// peer before it can read anything sent in the new generation.
    pub fn kem_ratchet_step(&mut self, peer_kem_public: &HybridPublicKey) -> Result<KemRatchetMessage> {
        let (message, prepared) = self.prepare_kem_step(peer_kem_public)?;
        self.commit_kem_step(prepared)?;
        Ok(message)
    }

    /// First half of [`RatchetState::kem_ratchet_step`]: encapsulates and
    /// builds the message without touching the state.
    ///
    /// Lets the caller seal the step message under the current generation
    /// before committing.
    pub fn prepare_kem_step(
        &self,
        peer_kem_public: &HybridPublicKey,
    ) -> Result<(KemRatchetMessage, PreparedKemStep)> {
        let next_generation = self
            .generation
            .checked_add(1)
            .ok_or_else(|| PqmsgError::invalid_state("Generation counter exhausted"))?;

        let (secret, ciphertext) = hybrid_encapsulate(peer_kem_public)?;
        let fresh = HybridKeyPair::generate();
        let message = KemRatchetMessage {
            ciphertext,
            recipient_key: *peer_kem_public.x25519_bytes(),
            generation: next_generation,
            sender_public: fresh.public_key().clone(),
        };
        let prepared = PreparedKemStep {
            secret,
            keypair: fresh,
            peer_public: peer_kem_public.clone(),
            generation: next_generation,
        };
        Ok((message, prepared))
    }

    /// Second half of [`RatchetState::kem_ratchet_step`].
    pub fn commit_kem_step(&mut self, prepared: PreparedKemStep) -> Result<()> {
        if prepared.generation != self.generation.wrapping_add(1) {
            return Err(PqmsgError::invalid_state(
                "Prepared KEM step does not follow the current generation",
            ));
        }
        self.apply_kem_secret(&prepared.secret, prepared.generation)?;
        self.own_kem_keypair = prepared.keypair;
        self.peer_kem_public_key = Some(prepared.peer_public);

        debug!(
            peer = %self.peer_identity,
            generation = prepared.generation,
            "KEM ratchet step sent"
        );
        Ok(())
    }

    /// Applies a KEM ratchet step received from the peer.
    ///
    /// Only the step to `generation + 1` is accepted. Crossing steps from
    /// both sides are rejected here; see [`RatchetState::initiates_kem_steps`].
    pub fn kem_ratchet_receive(&mut self, message: &KemRatchetMessage) -> Result<()> {
        let expected = self.generation.checked_add(1);
        if expected != Some(message.generation) {
            return Err(PqmsgError::invalid_state(format!(
                "Unexpected KEM step to generation {} at generation {}",
                message.generation, self.generation
            )));
        }

        let for_current = self.own_kem_public().x25519_bytes() == &message.recipient_key;
        let keypair = if for_current {
            &self.own_kem_keypair
        } else {
            self.retired_kem_keypair
                .as_ref()
                .filter(|retired| retired.public_key().x25519_bytes() == &message.recipient_key)
                .ok_or_else(|| PqmsgError::invalid_state("KEM step for an unknown key"))?
        };

        let secret = hybrid_decapsulate(keypair, &message.ciphertext)?;
        self.apply_kem_secret(&secret, message.generation)?;
        self.peer_kem_public_key = Some(message.sender_public.clone());
        if for_current {
            self.retired_kem_keypair = None;
        }

        debug!(
            peer = %self.peer_identity,
            generation = message.generation,
            "KEM ratchet step received"
        );
        Ok(())
    }

    fn apply_kem_secret(&mut self, secret: &HybridSharedSecret, generation: u32) -> Result<()> {
        let root_key = self.root_key.mix(secret)?;
        let (sending, receiving) = Self::assign_chains(&root_key, self.sends_outgoing)?;

        self.previous_receiving_chain = Some(PreviousChain {
            generation: self.generation,
            chain: self.receiving_chain_key.clone(),
            next_number: self.receiving_message_number,
        });
        self.root_key = root_key;
        self.sending_chain_key = sending;
        self.receiving_chain_key = receiving;
        self.sending_message_number = 0;
        self.receiving_message_number = 0;
        self.generation = generation;
        Ok(())
    }

    /// Replaces our KEM key pair with a fresh one and returns the new public
    /// key for the peer. The old pair stays usable for one incoming step.
    pub fn rotate_kem_keypair(&mut self) -> &HybridPublicKey {
        let fresh = HybridKeyPair::generate();
        self.retired_kem_keypair = Some(std::mem::replace(&mut self.own_kem_keypair, fresh));
        debug!(peer = %self.peer_identity, "Own KEM key rotated");
        self.own_kem_keypair.public_key()
    }

    /// True for the side that starts KEM steps in a session: the one whose
    /// identity sorts first. Both sides agree on it without negotiation.
    pub fn initiates_kem_steps(&self) -> bool {
        self.sends_outgoing
    }

    /// Returns true once the configured number of messages has been sent in
    /// the current generation.
    pub fn should_kem_ratchet(&self) -> bool {
        self.sending_message_number >= self.config.kem_interval
    }

    /// Serializes the full state for persistence. The output holds secrets.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        bincode::serialize(self)
            .map(Zeroizing::new)
            .map_err(|e| PqmsgError::serialization(e.to_string()))
    }

    /// Restores a state produced by [`RatchetState::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let state: Self =
            bincode::deserialize(bytes).map_err(|e| PqmsgError::serialization(e.to_string()))?;
        state.config.validate()?;
        Ok(state)
    }

    /// Number of KEM steps applied.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Next sending message number.
    pub fn sending_message_number(&self) -> u64 {
        self.sending_message_number
    }

    /// Next expected receiving message number.
    pub fn receiving_message_number(&self) -> u64 {
        self.receiving_message_number
    }

    /// Number of cached skipped keys.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped_message_keys.len()
    }

    /// Our current KEM public key, to be shared with the peer.
    pub fn own_kem_public(&self) -> &HybridPublicKey {
        self.own_kem_keypair.public_key()
    }

    /// The peer's latest KEM public key, if known.
    pub fn peer_kem_public(&self) -> Option<&HybridPublicKey> {
        self.peer_kem_public_key.as_ref()
    }

    /// Records the peer's KEM public key received during session setup.
    pub fn set_peer_kem_public(&mut self, key: HybridPublicKey) {
        self.peer_kem_public_key = Some(key);
    }

    /// Our identity.
    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    /// The peer's identity.
    pub fn peer_identity(&self) -> &str {
        &self.peer_identity
    }

    /// Ratchet tuning in effect.
    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    fn pair_with_config(config: RatchetConfig) -> (RatchetState, RatchetState) {
        let secret = random_bytes(HYBRID_SECRET_SIZE);
        let mut alice =
            RatchetState::establish_with_config(&secret, "alice.onion", "bob.onion", config)
                .unwrap();
        let mut bob =
            RatchetState::establish_with_config(&secret, "bob.onion", "alice.onion", config)
                .unwrap();
        alice.set_peer_kem_public(bob.own_kem_public().clone());
        bob.set_peer_kem_public(alice.own_kem_public().clone());
        (alice, bob)
    }

    fn pair() -> (RatchetState, RatchetState) {
        pair_with_config(RatchetConfig::default())
    }

    #[test]
    fn test_round_trip_both_directions() {
        let (mut alice, mut bob) = pair();

        let (ct, n) = alice.encrypt(b"hello bob").unwrap();
        assert_eq!(n, 0);
        assert_eq!(bob.decrypt(&ct, n).unwrap(), b"hello bob");

        let (ct, n) = bob.encrypt(b"hello alice").unwrap();
        assert_eq!(alice.decrypt(&ct, n).unwrap(), b"hello alice");
    }

    #[test]
    fn test_ciphertext_header() {
        let (mut alice, _) = pair();
        let (ct, _) = alice.encrypt(b"x").unwrap();
        assert_eq!(ct[0], PROTOCOL_VERSION);
        assert_eq!(&ct[1..5], &0u32.to_be_bytes());
        assert_eq!(ct.len(), HEADER_SIZE + AEAD_OVERHEAD + 1);
    }

    #[test]
    fn test_chain_roles_are_opposite() {
        let (alice, bob) = pair();
        assert_ne!(alice.sends_outgoing, bob.sends_outgoing);
        assert_eq!(alice.sending_chain_key, bob.receiving_chain_key);
        assert_eq!(alice.receiving_chain_key, bob.sending_chain_key);
    }

    #[test]
    fn test_sending_chain_replaced_after_encrypt() {
        let (mut alice, _) = pair();
        let before = alice.sending_chain_key.clone();
        alice.encrypt(b"x").unwrap();
        assert_ne!(alice.sending_chain_key, before);
        assert_eq!(alice.sending_message_number(), 1);
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (mut alice, mut bob) = pair();
        let sent: Vec<_> = (0..6)
            .map(|i| alice.encrypt(format!("msg {}", i).as_bytes()).unwrap())
            .collect();

        for &i in &[3usize, 1, 5, 2, 4, 0] {
            let (ct, n) = &sent[i];
            assert_eq!(bob.decrypt(ct, *n).unwrap(), format!("msg {}", i).as_bytes());
        }
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn test_duplicate_rejected() {
        let (mut alice, mut bob) = pair();
        let (ct, n) = alice.encrypt(b"once").unwrap();
        bob.decrypt(&ct, n).unwrap();
        assert!(matches!(
            bob.decrypt(&ct, n),
            Err(PqmsgError::DuplicateOrExpiredMessage {
                generation: 0,
                message_number: 0
            })
        ));
    }

    #[test]
    fn test_skip_limit_leaves_state_untouched() {
        let (mut alice, mut bob) = pair();
        let mut sent = Vec::new();
        for i in 0..=300u32 {
            sent.push(alice.encrypt(&i.to_be_bytes()).unwrap());
        }

        let (ct, n) = &sent[300];
        assert!(matches!(
            bob.decrypt(ct, *n),
            Err(PqmsgError::SkipLimitExceeded { gap: 300, limit: 256 })
        ));
        assert_eq!(bob.receiving_message_number(), 0);
        assert_eq!(bob.skipped_key_count(), 0);

        let (ct, n) = &sent[0];
        assert_eq!(bob.decrypt(ct, *n).unwrap(), 0u32.to_be_bytes());
    }

    #[test]
    fn test_gap_at_limit_allowed() {
        let (mut alice, mut bob) = pair();
        let mut last = None;
        for _ in 0..=DEFAULT_MAX_SKIP {
            last = Some(alice.encrypt(b"m").unwrap());
        }
        let (ct, n) = last.unwrap();
        assert_eq!(n, DEFAULT_MAX_SKIP);
        bob.decrypt(&ct, n).unwrap();
        assert_eq!(bob.skipped_key_count(), DEFAULT_MAX_SKIP as usize);
    }

    #[test]
    fn test_tampered_ciphertext_leaves_state_untouched() {
        let (mut alice, mut bob) = pair();
        let (_, _) = alice.encrypt(b"first").unwrap();
        let (mut ct, n) = alice.encrypt(b"second").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 1;

        assert!(matches!(bob.decrypt(&ct, n), Err(PqmsgError::DecryptionFailed)));
        assert_eq!(bob.receiving_message_number(), 0);
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn test_forged_packet_does_not_burn_skipped_key() {
        let (mut alice, mut bob) = pair();
        let (ct0, n0) = alice.encrypt(b"zero").unwrap();
        let (ct1, n1) = alice.encrypt(b"one").unwrap();
        bob.decrypt(&ct1, n1).unwrap();
        assert_eq!(bob.skipped_key_count(), 1);

        let mut forged = ct0.clone();
        forged[HEADER_SIZE + 3] ^= 0xff;
        assert!(bob.decrypt(&forged, n0).is_err());
        assert_eq!(bob.decrypt(&ct0, n0).unwrap(), b"zero");
    }

    #[test]
    fn test_wrong_message_number_fails() {
        let (mut alice, mut bob) = pair();
        alice.encrypt(b"a").unwrap();
        let (ct, _) = alice.encrypt(b"b").unwrap();
        assert!(matches!(bob.decrypt(&ct, 0), Err(PqmsgError::DecryptionFailed)));
    }

    #[test]
    fn test_counter_exhaustion_requires_kem_step() {
        let (mut alice, _) = pair();
        alice.sending_message_number = u64::MAX;
        assert!(matches!(
            alice.encrypt(b"x"),
            Err(PqmsgError::KemStepRequired)
        ));
        assert_eq!(alice.sending_message_number(), u64::MAX);
    }

    #[test]
    fn test_kem_step_both_directions() {
        let (mut alice, mut bob) = pair();
        let root_before = *alice.root_key.as_bytes();

        let bob_key = alice.peer_kem_public().unwrap().clone();
        let step = alice.kem_ratchet_step(&bob_key).unwrap();
        assert_eq!(step.generation, 1);
        assert_ne!(alice.root_key.as_bytes(), &root_before);
        bob.kem_ratchet_receive(&step).unwrap();
        assert_eq!(alice.root_key.as_bytes(), bob.root_key.as_bytes());

        let (ct, n) = alice.encrypt(b"after step").unwrap();
        assert_eq!(bob.decrypt(&ct, n).unwrap(), b"after step");

        let alice_key = bob.peer_kem_public().unwrap().clone();
        assert_eq!(&alice_key, alice.own_kem_public());
        let step = bob.kem_ratchet_step(&alice_key).unwrap();
        alice.kem_ratchet_receive(&step).unwrap();
        assert_eq!(alice.generation(), 2);

        let (ct, n) = bob.encrypt(b"second step").unwrap();
        assert_eq!(alice.decrypt(&ct, n).unwrap(), b"second step");
    }

    #[test]
    fn test_previous_generation_still_decrypts() {
        let (mut alice, mut bob) = pair();
        // Bob sends before seeing Alice's step.
        let (late, late_n) = bob.encrypt(b"sent before step").unwrap();

        let bob_key = alice.peer_kem_public().unwrap().clone();
        let step = alice.kem_ratchet_step(&bob_key).unwrap();
        assert_eq!(alice.decrypt(&late, late_n).unwrap(), b"sent before step");

        bob.kem_ratchet_receive(&step).unwrap();
        let (ct, n) = bob.encrypt(b"new generation").unwrap();
        assert_eq!(alice.decrypt(&ct, n).unwrap(), b"new generation");
    }

    #[test]
    fn test_two_generations_back_expired() {
        let (mut alice, mut bob) = pair();
        let (old, old_n) = bob.encrypt(b"too old").unwrap();

        for _ in 0..2 {
            let bob_key = alice.peer_kem_public().unwrap().clone();
            let step = alice.kem_ratchet_step(&bob_key).unwrap();
            bob.kem_ratchet_receive(&step).unwrap();
        }
        assert!(matches!(
            alice.decrypt(&old, old_n),
            Err(PqmsgError::DuplicateOrExpiredMessage { generation: 0, .. })
        ));
    }

    #[test]
    fn test_future_generation_rejected() {
        let (mut alice, mut bob) = pair();
        let bob_key = alice.peer_kem_public().unwrap().clone();
        let _step = alice.kem_ratchet_step(&bob_key).unwrap();
        let (ct, n) = alice.encrypt(b"early").unwrap();
        assert!(matches!(bob.decrypt(&ct, n), Err(PqmsgError::InvalidState(_))));
    }

    #[test]
    fn test_out_of_sequence_kem_step_rejected() {
        let (mut alice, mut bob) = pair();
        let bob_key = alice.peer_kem_public().unwrap().clone();
        let first = alice.kem_ratchet_step(&bob_key).unwrap();
        let second = alice.kem_ratchet_step(&bob_key).unwrap();

        assert!(matches!(
            bob.kem_ratchet_receive(&second),
            Err(PqmsgError::InvalidState(_))
        ));
        assert_eq!(bob.generation(), 0);
        bob.kem_ratchet_receive(&first).unwrap();
        bob.kem_ratchet_receive(&second).unwrap();
        assert_eq!(bob.root_key.as_bytes(), alice.root_key.as_bytes());
    }

    #[test]
    fn test_concurrent_kem_steps_detected() {
        let (mut alice, mut bob) = pair();
        let bob_key = alice.peer_kem_public().unwrap().clone();
        let alice_key = bob.peer_kem_public().unwrap().clone();
        let from_alice = alice.kem_ratchet_step(&bob_key).unwrap();
        let _from_bob = bob.kem_ratchet_step(&alice_key).unwrap();
        assert!(bob.kem_ratchet_receive(&from_alice).is_err());
    }

    #[test]
    fn test_exactly_one_side_initiates() {
        let (alice, bob) = pair();
        assert!(alice.initiates_kem_steps());
        assert!(!bob.initiates_kem_steps());
    }

    #[test]
    fn test_step_for_retired_key_still_applies() {
        let (mut alice, mut bob) = pair();
        let original = bob.own_kem_public().clone();
        let step = alice.kem_ratchet_step(&original).unwrap();

        // Bob rotates before the step reaches him.
        let rotated = bob.rotate_kem_keypair().clone();
        assert_ne!(rotated, original);
        bob.kem_ratchet_receive(&step).unwrap();
        assert_eq!(bob.root_key.as_bytes(), alice.root_key.as_bytes());
        assert!(bob.retired_kem_keypair.is_some());

        let step = alice.kem_ratchet_step(&rotated).unwrap();
        bob.kem_ratchet_receive(&step).unwrap();
        assert_eq!(bob.generation(), 2);
        assert!(bob.retired_kem_keypair.is_none());
    }

    #[test]
    fn test_step_for_unknown_key_rejected() {
        let (mut alice, mut bob) = pair();
        let original = bob.own_kem_public().clone();
        let step = alice.kem_ratchet_step(&original).unwrap();

        bob.rotate_kem_keypair();
        bob.rotate_kem_keypair();
        assert!(matches!(
            bob.kem_ratchet_receive(&step),
            Err(PqmsgError::InvalidState(_))
        ));
        assert_eq!(bob.generation(), 0);
    }

    fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    #[test]
    fn test_used_keys_not_retained() {
        let (mut alice, mut bob) = pair();
        let mut used: Vec<[u8; 32]> = Vec::new();
        let mut sent = Vec::new();
        for i in 0..8u8 {
            let (_, message_key) = alice.sending_chain_key.step().unwrap();
            used.push(*alice.sending_chain_key.as_bytes());
            used.push(*message_key.as_bytes());
            sent.push(alice.encrypt(&[i]).unwrap());
        }

        // Out of order, so several positions pass through the skipped cache.
        for &i in &[2usize, 0, 5, 1, 3, 4, 7, 6] {
            let (ct, n) = &sent[i];
            assert_eq!(bob.decrypt(ct, *n).unwrap(), [i as u8]);
        }
        assert_eq!(bob.skipped_key_count(), 0);

        let alice_state = alice.to_bytes().unwrap();
        let bob_state = bob.to_bytes().unwrap();
        // The live chain key is found, so the search itself works.
        assert!(contains_bytes(&alice_state, alice.sending_chain_key.as_bytes()));
        assert!(contains_bytes(&bob_state, bob.receiving_chain_key.as_bytes()));
        for key in &used {
            assert!(!contains_bytes(&alice_state, key));
            assert!(!contains_bytes(&bob_state, key));
        }

        // A KEM step drops the old sending chain as well.
        let old_sending = *alice.sending_chain_key.as_bytes();
        let bob_key = bob.own_kem_public().clone();
        alice.kem_ratchet_step(&bob_key).unwrap();
        assert!(!contains_bytes(&alice.to_bytes().unwrap(), &old_sending));
    }

    #[test]
    fn test_should_kem_ratchet() {
        let config = RatchetConfig {
            kem_interval: 3,
            ..RatchetConfig::default()
        };
        let (mut alice, _) = pair_with_config(config);
        for _ in 0..2 {
            alice.encrypt(b"x").unwrap();
            assert!(!alice.should_kem_ratchet());
        }
        alice.encrypt(b"x").unwrap();
        assert!(alice.should_kem_ratchet());

        let bob_key = alice.peer_kem_public().unwrap().clone();
        alice.kem_ratchet_step(&bob_key).unwrap();
        assert!(!alice.should_kem_ratchet());
    }

    #[test]
    fn test_skipped_keys_bounded_oldest_evicted() {
        let config = RatchetConfig {
            max_skipped_keys: 4,
            ..RatchetConfig::default()
        };
        let (mut alice, mut bob) = pair_with_config(config);
        let sent: Vec<_> = (0..7).map(|_| alice.encrypt(b"m").unwrap()).collect();

        bob.decrypt(&sent[6].0, sent[6].1).unwrap();
        assert_eq!(bob.skipped_key_count(), 4);
        assert!(matches!(
            bob.decrypt(&sent[0].0, sent[0].1),
            Err(PqmsgError::DuplicateOrExpiredMessage { .. })
        ));
        bob.decrypt(&sent[5].0, sent[5].1).unwrap();
    }

    #[test]
    fn test_serialization_roundtrip() {
        let (mut alice, mut bob) = pair();
        let sent: Vec<_> = (0..3).map(|_| alice.encrypt(b"m").unwrap()).collect();
        bob.decrypt(&sent[2].0, sent[2].1).unwrap();

        let bytes = bob.to_bytes().unwrap();
        let mut restored = RatchetState::from_bytes(&bytes).unwrap();
        assert_eq!(restored.skipped_key_count(), 2);
        assert_eq!(restored.decrypt(&sent[0].0, sent[0].1).unwrap(), b"m");

        let bob_key = alice.peer_kem_public().unwrap().clone();
        let step = alice.kem_ratchet_step(&bob_key).unwrap();
        restored.kem_ratchet_receive(&step).unwrap();
        let (ct, n) = alice.encrypt(b"after restore").unwrap();
        assert_eq!(restored.decrypt(&ct, n).unwrap(), b"after restore");
    }

    #[test]
    fn test_kem_message_bytes_roundtrip() {
        let (mut alice, _) = pair();
        let bob_key = alice.peer_kem_public().unwrap().clone();
        let step = alice.kem_ratchet_step(&bob_key).unwrap();
        let parsed = KemRatchetMessage::from_bytes(&step.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, step);
    }

    #[test]
    fn test_establish_validation() {
        let secret = random_bytes(HYBRID_SECRET_SIZE);
        assert!(matches!(
            RatchetState::establish(&secret[..32], "a", "b"),
            Err(PqmsgError::InvalidKeyLength {
                expected: 64,
                actual: 32
            })
        ));
        assert!(RatchetState::establish(&secret, "same", "same").is_err());
        assert!(RatchetState::establish(&secret, "", "b").is_err());
    }

    #[test]
    fn test_debug_hides_keys() {
        let (alice, _) = pair();
        let rendered = format!("{:?}", alice);
        assert!(rendered.contains("generation"));
        assert!(!rendered.contains("root_key"));
    }
}
