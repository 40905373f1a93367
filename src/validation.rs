//! Input validation and inbound rate limiting.
//!
//! Everything that arrives from the transport is checked against these
//! limits before any cryptographic work is spent on it.

use crate::clock::SharedClock;
use crate::crypto::AEAD_OVERHEAD;
use crate::error::{PqmsgError, Result};
use crate::ping::token::TOKEN_NONCE_SIZE;
use crate::ratchet::HEADER_SIZE;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Maximum identity (onion address) length in bytes
pub const MAX_IDENTITY_LENGTH: usize = 128;

/// Maximum contact id length in bytes
pub const MAX_CONTACT_ID_LENGTH: usize = 128;

/// Length of a ping id: hex of the token nonce
pub const PING_ID_LENGTH: usize = TOKEN_NONCE_SIZE * 2;

/// Maximum encoded size of a signed wake token
pub const MAX_TOKEN_SIZE: usize = 1024;

/// Per-packet framing cost on top of the payload: message number, ratchet
/// header and AEAD nonce and tag.
pub const FRAMING_OVERHEAD: usize = 8 + HEADER_SIZE + AEAD_OVERHEAD;

/// Rate limiting configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum operations per time window
    pub max_operations: usize,
    /// Time window in milliseconds
    pub window_ms: u64,
}

impl RateLimit {
    pub fn new(max_operations: usize, window_ms: u64) -> Self {
        Self {
            max_operations,
            window_ms,
        }
    }

    /// Inbound pings per contact (30 per minute)
    pub fn inbound_ping_default() -> Self {
        Self::new(30, 60 * 1000)
    }

    /// Explicit manual download retries per contact (10 per minute)
    pub fn manual_retry_default() -> Self {
        Self::new(10, 60 * 1000)
    }
}

/// Sliding-window rate limiter keyed by contact.
pub struct RateLimiter {
    operations: Mutex<HashMap<String, VecDeque<u64>>>,
    config: RateLimit,
    clock: SharedClock,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimit, clock: SharedClock) -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Records one operation for `identifier`, or rejects it if the window
    /// is full. Rejected operations are not recorded.
    pub fn check_rate_limit(&self, identifier: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let mut operations = self.operations.lock().unwrap();
        let history = operations.entry(identifier.to_string()).or_default();

        while history
            .front()
            .is_some_and(|&time| now.saturating_sub(time) >= self.config.window_ms)
        {
            history.pop_front();
        }

        if history.len() >= self.config.max_operations {
            return Err(PqmsgError::validation(format!(
                "Rate limit exceeded: {} operations in {} ms",
                self.config.max_operations, self.config.window_ms
            )));
        }

        history.push_back(now);
        Ok(())
    }

    /// Drops identifiers with no operation inside the window.
    pub fn prune(&self) {
        let now = self.clock.now_ms();
        let window = self.config.window_ms;
        self.operations.lock().unwrap().retain(|_, history| {
            history
                .back()
                .is_some_and(|&time| now.saturating_sub(time) < window)
        });
    }

    pub fn tracked_identifiers(&self) -> usize {
        self.operations.lock().unwrap().len()
    }
}

/// Validation functions for inbound data
pub struct Validator;

impl Validator {
    /// Validate a peer or local identity
    pub fn validate_identity(identity: &str) -> Result<()> {
        Self::validate_identifier("Identity", identity, MAX_IDENTITY_LENGTH)
    }

    /// Validate a contact id
    pub fn validate_contact_id(contact_id: &str) -> Result<()> {
        Self::validate_identifier("Contact id", contact_id, MAX_CONTACT_ID_LENGTH)
    }

    fn validate_identifier(what: &str, value: &str, max_len: usize) -> Result<()> {
        if value.len() > max_len {
            return Err(PqmsgError::validation(format!(
                "{} too long: {} bytes exceeds maximum of {} bytes",
                what,
                value.len(),
                max_len
            )));
        }
        if value.trim().is_empty() {
            return Err(PqmsgError::validation(format!("{} cannot be empty", what)));
        }
        if value.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(PqmsgError::validation(format!(
                "{} contains whitespace or control characters",
                what
            )));
        }
        Ok(())
    }

    /// Validate a ping id: lowercase hex of a token nonce
    pub fn validate_ping_id(ping_id: &str) -> Result<()> {
        if ping_id.len() != PING_ID_LENGTH
            || !ping_id
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(PqmsgError::validation(format!(
                "Malformed ping id of length {}",
                ping_id.len()
            )));
        }
        Ok(())
    }

    /// Validate an encoded wake token size
    pub fn validate_token_size(data: &[u8]) -> Result<()> {
        if data.len() > MAX_TOKEN_SIZE {
            return Err(PqmsgError::validation(format!(
                "Token too large: {} bytes exceeds maximum of {} bytes",
                data.len(),
                MAX_TOKEN_SIZE
            )));
        }
        Ok(())
    }

    /// Validate that an inbound packet has exactly the padded size
    pub fn validate_packet_size(packet: &[u8], packet_size: usize) -> Result<()> {
        if packet.len() != packet_size {
            return Err(PqmsgError::validation(format!(
                "Packet of {} bytes, expected {}",
                packet.len(),
                packet_size
            )));
        }
        Ok(())
    }

    /// Largest plaintext that fits in one padded packet, before envelope
    /// encoding.
    pub fn max_plaintext_size(packet_size: usize) -> usize {
        packet_size.saturating_sub(crate::padding::LENGTH_PREFIX_SIZE + FRAMING_OVERHEAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    #[test]
    fn test_rate_limiter_window() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(RateLimit::new(2, 1_000), clock.clone());

        assert!(limiter.check_rate_limit("alice").is_ok());
        assert!(limiter.check_rate_limit("alice").is_ok());
        assert!(limiter.check_rate_limit("alice").is_err());
        assert!(limiter.check_rate_limit("bob").is_ok());

        clock.advance(999);
        assert!(limiter.check_rate_limit("alice").is_err());
        clock.advance(1);
        assert!(limiter.check_rate_limit("alice").is_ok());
    }

    #[test]
    fn test_rate_limiter_prune() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(RateLimit::inbound_ping_default(), clock.clone());
        limiter.check_rate_limit("alice").unwrap();
        limiter.check_rate_limit("bob").unwrap();
        clock.advance(30_000);
        limiter.check_rate_limit("bob").unwrap();
        clock.advance(30_000);

        limiter.prune();
        assert_eq!(limiter.tracked_identifiers(), 1);
    }

    #[test]
    fn test_identity_validation() {
        assert!(Validator::validate_identity("abcdefghijklmnop.onion").is_ok());
        assert!(Validator::validate_identity("").is_err());
        assert!(Validator::validate_identity("has space").is_err());
        assert!(Validator::validate_identity("nul\0byte").is_err());
        assert!(Validator::validate_identity(&"a".repeat(MAX_IDENTITY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_ping_id_validation() {
        assert!(Validator::validate_ping_id(&"ab".repeat(TOKEN_NONCE_SIZE)).is_ok());
        assert!(Validator::validate_ping_id(&"AB".repeat(TOKEN_NONCE_SIZE)).is_err());
        assert!(Validator::validate_ping_id("abcd").is_err());
    }

    #[test]
    fn test_packet_size_validation() {
        assert!(Validator::validate_packet_size(&[0u8; 4096], 4096).is_ok());
        assert!(Validator::validate_packet_size(&[0u8; 4095], 4096).is_err());
        assert_eq!(
            Validator::max_plaintext_size(4096),
            4096 - 4 - 8 - HEADER_SIZE - AEAD_OVERHEAD
        );
    }
}
