//! XChaCha20-Poly1305 authenticated encryption.
//!
//! Output layout is `nonce (24) || ciphertext || tag (16)`. A fresh random
//! nonce is drawn for every call, so the same key may safely encrypt many
//! messages; the ratchet nevertheless uses each message key exactly once.

use crate::error::{PqmsgError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};

/// AEAD key size in bytes.
pub const AEAD_KEY_SIZE: usize = 32;

/// XChaCha20 nonce size in bytes.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Poly1305 tag size in bytes.
pub const AEAD_TAG_SIZE: usize = 16;

/// Smallest valid AEAD output (empty plaintext).
pub const AEAD_OVERHEAD: usize = AEAD_NONCE_SIZE + AEAD_TAG_SIZE;

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != AEAD_KEY_SIZE {
        return Err(PqmsgError::key_length(AEAD_KEY_SIZE, key.len()));
    }
    XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| PqmsgError::key_length(AEAD_KEY_SIZE, key.len()))
}

/// Encrypts `plaintext` under `key`, binding `associated_data`.
pub fn aead_encrypt(key: &[u8], plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;

    let mut nonce_bytes = [0u8; AEAD_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        // Encryption only fails on absurd input lengths.
        .map_err(|_| PqmsgError::validation("Plaintext too large for AEAD"))?;

    let mut out = Vec::with_capacity(AEAD_NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts the output of [`aead_encrypt`].
///
/// Fails closed with [`PqmsgError::DecryptionFailed`] on any tag mismatch,
/// truncation, or wrong associated data. The tag check inside
/// `chacha20poly1305` is constant time.
pub fn aead_decrypt(key: &[u8], sealed: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;

    if sealed.len() < AEAD_OVERHEAD {
        return Err(PqmsgError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(AEAD_NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| PqmsgError::DecryptionFailed)
}
