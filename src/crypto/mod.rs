//! Cryptographic primitives for the messaging core.
//!
//! Every primitive is a plain function over byte buffers with explicit key
//! lengths:
//!
//! - **XChaCha20-Poly1305**: message and storage encryption
//! - **X25519 + ML-KEM-1024**: hybrid key encapsulation for ratchet steps
//! - **Ed25519**: signatures on wake and delivery tokens
//! - **Argon2id**: passphrase-derived storage keys
//! - **BLAKE3**: keyed replay fingerprints
//!
//! Comparisons of secret material go through [`TimingSafe`].

use rand::{rngs::OsRng, RngCore};

pub mod aead;
pub mod hash;
pub mod kem;
pub mod password;
pub mod signature;
pub mod timing;

pub use aead::{aead_decrypt, aead_encrypt, AEAD_KEY_SIZE, AEAD_NONCE_SIZE, AEAD_OVERHEAD};
pub use hash::{hash_data, keyed_fingerprint, FINGERPRINT_SIZE};
pub use kem::{
    hybrid_decapsulate, hybrid_encapsulate, HybridCiphertext, HybridKeyPair, HybridPublicKey,
    HybridSharedSecret, HYBRID_SECRET_SIZE,
};
pub use password::{generate_salt, hash_password, verify_password, Password, StorageKey};
pub use signature::{generate_signing_key, sign, verify, SigningKey, VerifyingKey};
pub use timing::TimingSafe;

/// Fills a fresh buffer of `len` bytes from the OS random source.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Returns a fixed-size array of random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Short printable identifier for key material: hex of the first 8 bytes of
/// its BLAKE3 digest. Safe to log.
pub fn key_id_hex(key_material: &[u8]) -> String {
    hex::encode(&hash_data(key_material)[..8])
}
