//! Bounded replay cache.
//!
//! Remembers keyed fingerprints of recently seen messages and wake signals so
//! that a replayed packet is dropped before it reaches the ratchet. The cache
//! lives in memory only; durable idempotency comes from the ping inbox.

use crate::crypto::{keyed_fingerprint, random_array, FINGERPRINT_SIZE};
use crate::error::{PqmsgError, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{trace, warn};

/// Default number of fingerprints kept.
pub const DEFAULT_REPLAY_CAPACITY: usize = 10_000;

/// Keyed BLAKE3 fingerprint.
pub type Fingerprint = [u8; FINGERPRINT_SIZE];

/// Replay cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Maximum number of fingerprints held before the oldest is evicted
    pub capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }
}

/// Fixed-capacity set of recently seen fingerprints.
pub struct ReplayCache {
    fingerprint_key: [u8; FINGERPRINT_SIZE],
    seen: Mutex<LruCache<Fingerprint, ()>>,
}

impl std::fmt::Debug for ReplayCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl ReplayCache {
    /// Creates a cache holding at most `capacity` fingerprints.
    ///
    /// The fingerprint key is drawn fresh, so fingerprints are meaningless
    /// outside this process.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| PqmsgError::config("Replay cache capacity must be non-zero"))?;
        Ok(Self {
            fingerprint_key: random_array(),
            seen: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Creates a cache from configuration.
    pub fn from_config(config: &ReplayConfig) -> Result<Self> {
        Self::new(config.capacity)
    }

    /// Computes the fingerprint of `bytes` as sent by `scope` (usually the
    /// sender identity).
    pub fn fingerprint(&self, scope: &[u8], bytes: &[u8]) -> Fingerprint {
        keyed_fingerprint(&self.fingerprint_key, scope, bytes)
    }

    /// Records `fingerprint`. Returns `true` if it was new, `false` if it is
    /// a duplicate.
    ///
    /// A duplicate does not refresh the entry, so eviction follows insertion
    /// order.
    pub fn check_and_insert(&self, fingerprint: Fingerprint) -> bool {
        let mut seen = self.seen.lock().unwrap();
        if seen.contains(&fingerprint) {
            warn!(
                fingerprint = %hex::encode(&fingerprint[..8]),
                "Replay detected, dropping duplicate"
            );
            return false;
        }

        if let Some((evicted, _)) = seen.push(fingerprint, ()) {
            trace!(
                evicted = %hex::encode(&evicted[..8]),
                "Replay cache full, evicted oldest fingerprint"
            );
        }
        true
    }

    /// Fingerprints and records `bytes` in one call.
    pub fn check_bytes(&self, scope: &[u8], bytes: &[u8]) -> bool {
        let fingerprint = self.fingerprint(scope, bytes);
        self.check_and_insert(fingerprint)
    }

    /// Returns whether `fingerprint` is currently held, without inserting.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.lock().unwrap().contains(fingerprint)
    }

    /// Number of fingerprints held.
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of fingerprints held.
    pub fn capacity(&self) -> usize {
        self.seen.lock().unwrap().cap().get()
    }

    /// Forgets every fingerprint.
    pub fn clear(&self) {
        self.seen.lock().unwrap().clear();
    }
}
