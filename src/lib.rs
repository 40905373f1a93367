//! # pqmsg - post-quantum messaging core
//!
//! The cryptographic and reliability core of a peer-to-peer messenger that
//! talks over an anonymizing transport. Peers are often offline, so delivery
//! is driven by a small signed wake handshake and every message is protected
//! by a post-quantum double ratchet.
//!
//! ## Components
//!
//! - **Ratchet** ([`ratchet`]): symmetric hash ratchet with periodic hybrid
//!   X25519 + ML-KEM-1024 steps, out-of-order delivery and a bounded skipped
//!   key cache
//! - **Wake protocol** ([`ping`]): signed ping/pong/ACK tokens and the
//!   persistent inbox state machine that drives downloads exactly once
//! - **Replay cache** ([`replay`]): bounded LRU of keyed fingerprints
//! - **ACK tracking** ([`ack`]): resend the exact same bytes until the peer
//!   confirms delivery
//! - **Padding** ([`padding`]): fixed-size packets and randomized send delay
//! - **Session** ([`session`]): one peer conversation wiring all of the above
//! - **Storage** ([`storage`]): encrypted ratchet states and the ping inbox on
//!   RocksDB
//!
//! ## Example
//!
//! ```rust,no_run
//! use pqmsg::crypto::kem::{hybrid_decapsulate, hybrid_encapsulate, HybridKeyPair};
//! use pqmsg::{AckConfig, MonotonicClock, PaddingConfig, RatchetState, ReplayCache, Session};
//! use std::sync::Arc;
//! # fn main() -> pqmsg::Result<()> {
//! let bob_kem = HybridKeyPair::generate();
//! let (secret, ciphertext) = hybrid_encapsulate(bob_kem.public_key())?;
//! let bob_secret = hybrid_decapsulate(&bob_kem, &ciphertext)?;
//!
//! let replay = Arc::new(ReplayCache::new(10_000)?);
//! let clock = MonotonicClock::shared();
//! let mut alice = Session::new(
//!     RatchetState::establish(secret.as_bytes(), "alice", "bob")?,
//!     AckConfig::default(),
//!     PaddingConfig::no_delay(),
//!     replay.clone(),
//!     clock.clone(),
//! );
//! let mut bob = Session::new(
//!     RatchetState::establish(bob_secret.as_bytes(), "bob", "alice")?,
//!     AckConfig::default(),
//!     PaddingConfig::no_delay(),
//!     replay,
//!     clock,
//! );
//!
//! let outbound = alice.send(b"hello")?;
//! let received = bob.receive(&outbound.packet)?;
//! println!("{:?}", received);
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod cli;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod padding;
pub mod ping;
pub mod ratchet;
pub mod replay;
pub mod session;
pub mod storage;
pub mod validation;

pub use ack::{AckConfig, AckTracker, RetryAction};
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use config::CoreConfig;
pub use error::{PqmsgError, Result};
pub use padding::PaddingConfig;
pub use ping::{PingConfig, PingInbox, PingState, WakeHandler, Watchdog};
pub use ratchet::{KemRatchetMessage, RatchetConfig, RatchetState};
pub use replay::{ReplayCache, ReplayConfig};
pub use session::{Envelope, OutboundPacket, Received, Session};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
