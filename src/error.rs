//! Error types for the messaging core.

use thiserror::Error;

/// Result type alias for messaging core operations.
pub type Result<T> = std::result::Result<T, PqmsgError>;

/// Main error type for messaging core operations.
#[derive(Error, Debug)]
pub enum PqmsgError {
    /// A key or secret had the wrong length
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// AEAD authentication failed; no plaintext is ever returned
    #[error("Decryption failed")]
    DecryptionFailed,

    /// The message key was already consumed or has been evicted
    #[error("Duplicate or expired message: generation {generation}, number {message_number}")]
    DuplicateOrExpiredMessage { generation: u32, message_number: u64 },

    /// The message number is too far ahead of the receiving chain
    #[error("Too many skipped messages: gap of {gap} exceeds limit {limit}")]
    SkipLimitExceeded { gap: u64, limit: u64 },

    /// The sending chain is exhausted and a KEM ratchet step must run first
    #[error("Sending chain exhausted, KEM ratchet step required")]
    KemStepRequired,

    /// Ed25519 signature verification failed
    #[error("Invalid signature")]
    InvalidSignature,

    /// A conditional transition affected no rows because another actor won
    #[error("Claim lost for {0}")]
    ClaimLost(String),

    /// Automatic retries are exhausted; the item needs user action
    #[error("Retry exhausted for {0}")]
    RetryExhausted(String),

    /// The ratchet or inbox is not in a state that allows the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Key encapsulation errors
    #[error("KEM error: {0}")]
    Kem(String),

    /// Padding and traffic shaping errors
    #[error("Padding error: {0}")]
    Padding(String),

    /// Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Password-related errors
    #[error("Password error: {0}")]
    Password(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PqmsgError {
    /// Creates an invalid key length error.
    pub fn key_length(expected: usize, actual: usize) -> Self {
        Self::InvalidKeyLength { expected, actual }
    }

    /// Creates a new invalid state error.
    pub fn invalid_state<T: ToString>(msg: T) -> Self {
        Self::InvalidState(msg.to_string())
    }

    /// Creates a new KEM error.
    pub fn kem<T: ToString>(msg: T) -> Self {
        Self::Kem(msg.to_string())
    }

    /// Creates a new padding error.
    pub fn padding<T: ToString>(msg: T) -> Self {
        Self::Padding(msg.to_string())
    }

    /// Creates a new validation error.
    pub fn validation<T: ToString>(msg: T) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Creates a new storage error.
    pub fn storage<T: ToString>(msg: T) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Creates a new serialization error.
    pub fn serialization<T: ToString>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Creates a new configuration error.
    pub fn config<T: ToString>(msg: T) -> Self {
        Self::Config(msg.to_string())
    }

    /// Creates a new password error.
    pub fn password<T: ToString>(msg: T) -> Self {
        Self::Password(msg.to_string())
    }

    /// Returns true for outcomes that are expected during normal operation
    /// and should be absorbed instead of surfaced to the user.
    pub fn is_routine(&self) -> bool {
        matches!(self, Self::ClaimLost(_))
    }

    /// Returns true if the error means the message can never be decrypted
    /// with the current state, so the caller should request retransmission
    /// or mark it failed rather than retry locally.
    pub fn is_undecryptable(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFailed
                | Self::DuplicateOrExpiredMessage { .. }
                | Self::SkipLimitExceeded { .. }
        )
    }
}
