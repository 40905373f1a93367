//! Password-derived storage keys using Argon2id.
//!
//! Persisted ratchet state is sealed with XChaCha20-Poly1305 under a key
//! derived from the user's passphrase. The salt is stored next to the data;
//! the key itself never touches disk.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::aead::{aead_decrypt, aead_encrypt, AEAD_KEY_SIZE};
use crate::error::{PqmsgError, Result};

/// Salt size for Argon2 (128 bits)
pub const SALT_SIZE: usize = 16;

/// Parameters for Argon2id password hashing
const ARGON2_PARAMS: argon2::Params = match argon2::Params::new(
    19 * 1024, // 19 MiB memory cost
    2,         // 2 iterations
    1,         // 1 lane
    Some(AEAD_KEY_SIZE),
) {
    Ok(params) => params,
    Err(_) => panic!("Invalid Argon2 parameters"),
};

fn argon2id() -> Argon2<'static> {
    Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        ARGON2_PARAMS,
    )
}

/// Passphrase protecting local state.
#[derive(Clone)]
pub struct Password(String);

impl Password {
    /// Create a new password from a string
    pub fn new(password: String) -> Self {
        Self(password)
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Check if password is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password([REDACTED])")
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Generates a random salt for [`StorageKey::derive`].
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// A 32-byte key sealing data at rest.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StorageKey([u8; AEAD_KEY_SIZE]);

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageKey([REDACTED])")
    }
}

impl StorageKey {
    /// Derives a storage key from a password and salt with Argon2id.
    pub fn derive(password: &Password, salt: &[u8; SALT_SIZE]) -> Result<Self> {
        if password.is_empty() {
            return Err(PqmsgError::password("Password cannot be empty"));
        }

        let mut key = [0u8; AEAD_KEY_SIZE];
        argon2id()
            .hash_password_into(password.as_bytes(), salt, &mut key)
            .map_err(|e| PqmsgError::password(format!("Key derivation failed: {}", e)))?;

        Ok(Self(key))
    }

    /// Wraps an existing key, e.g. one held by a platform keystore.
    pub fn from_bytes(bytes: [u8; AEAD_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Encrypts `plaintext`, binding `context` (typically the record key).
    pub fn seal(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        aead_encrypt(&self.0, plaintext, context)
    }

    /// Decrypts a blob produced by [`StorageKey::seal`] with the same context.
    pub fn open(&self, sealed: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        aead_decrypt(&self.0, sealed, context)
    }
}

/// Hashes a password into a PHC string for later verification.
pub fn hash_password(password: &Password) -> Result<String> {
    if password.is_empty() {
        return Err(PqmsgError::password("Password cannot be empty"));
    }

    let salt_string = SaltString::encode_b64(&generate_salt())
        .map_err(|e| PqmsgError::password(format!("Invalid salt: {}", e)))?;

    let hash = argon2id()
        .hash_password(password.as_bytes(), &salt_string)
        .map_err(|e| PqmsgError::password(format!("Password hashing failed: {}", e)))?;

    Ok(hash.to_string())
}

/// Verifies a password against a PHC string from [`hash_password`].
pub fn verify_password(password: &Password, expected_hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(expected_hash)
        .map_err(|e| PqmsgError::password(format!("Invalid password hash: {}", e)))?;

    match argon2id().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PqmsgError::password(format!(
            "Password verification failed: {}",
            e
        ))),
    }
}
