//! Hybrid key encapsulation: X25519 combined with ML-KEM-1024.
//!
//! The shared secret stays safe as long as either component holds. Both
//! component secrets are concatenated and run through HKDF-SHA256 under a
//! fixed domain label to produce 64 bytes of output keying material.

use crate::error::{PqmsgError, Result};
use hkdf::Hkdf;
use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the combined hybrid shared secret.
pub const HYBRID_SECRET_SIZE: usize = 64;

/// Size of an X25519 key.
pub const X25519_KEY_SIZE: usize = 32;

/// HKDF info label for combining the two component secrets.
const HYBRID_KDF_INFO: &[u8] = b"pqmsg-hybrid-kem-v1";

/// A 64-byte secret shared after a hybrid encapsulation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HybridSharedSecret([u8; HYBRID_SECRET_SIZE]);

impl fmt::Debug for HybridSharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HybridSharedSecret")
            .field(&"[REDACTED]")
            .finish()
    }
}

impl HybridSharedSecret {
    /// Wraps raw secret bytes.
    pub fn from_bytes(bytes: [u8; HYBRID_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the secret bytes.
    pub fn as_bytes(&self) -> &[u8; HYBRID_SECRET_SIZE] {
        &self.0
    }
}

/// Public half of a hybrid key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridPublicKey {
    x25519: [u8; X25519_KEY_SIZE],
    mlkem: Vec<u8>,
}

impl fmt::Debug for HybridPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridPublicKey")
            .field("x25519", &hex::encode(&self.x25519[..8]))
            .field("mlkem_size", &self.mlkem.len())
            .finish()
    }
}

impl HybridPublicKey {
    /// Builds a public key from its components, validating the ML-KEM part.
    pub fn from_parts(x25519: [u8; X25519_KEY_SIZE], mlkem: Vec<u8>) -> Result<Self> {
        mlkem1024::PublicKey::from_bytes(&mlkem)
            .map_err(|_| PqmsgError::key_length(mlkem1024::public_key_bytes(), mlkem.len()))?;
        Ok(Self { x25519, mlkem })
    }

    /// Returns the X25519 component.
    pub fn x25519_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.x25519
    }

    /// Returns the ML-KEM-1024 component.
    pub fn mlkem_bytes(&self) -> &[u8] {
        &self.mlkem
    }

    fn as_mlkem(&self) -> Result<mlkem1024::PublicKey> {
        mlkem1024::PublicKey::from_bytes(&self.mlkem)
            .map_err(|_| PqmsgError::kem("Invalid ML-KEM public key"))
    }
}

/// A rotating hybrid key pair used for KEM ratchet steps.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct HybridKeyPair {
    #[zeroize(skip)]
    public: HybridPublicKey,
    x25519_secret: [u8; X25519_KEY_SIZE],
    mlkem_secret: Vec<u8>,
}

impl fmt::Debug for HybridKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridKeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl HybridKeyPair {
    /// Generates a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        let x_secret = StaticSecret::random_from_rng(OsRng);
        let x_public = X25519Public::from(&x_secret);
        let (kem_public, kem_secret) = mlkem1024::keypair();

        Self {
            public: HybridPublicKey {
                x25519: x_public.to_bytes(),
                mlkem: kem_public.as_bytes().to_vec(),
            },
            x25519_secret: x_secret.to_bytes(),
            mlkem_secret: kem_secret.as_bytes().to_vec(),
        }
    }

    /// Returns the public half.
    pub fn public_key(&self) -> &HybridPublicKey {
        &self.public
    }
}

/// Ciphertext produced by [`hybrid_encapsulate`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridCiphertext {
    x25519_ephemeral: [u8; X25519_KEY_SIZE],
    mlkem: Vec<u8>,
}

impl fmt::Debug for HybridCiphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridCiphertext")
            .field("size", &(X25519_KEY_SIZE + self.mlkem.len()))
            .finish()
    }
}

impl HybridCiphertext {
    /// Serializes as `x25519_ephemeral || mlkem_ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(X25519_KEY_SIZE + self.mlkem.len());
        out.extend_from_slice(&self.x25519_ephemeral);
        out.extend_from_slice(&self.mlkem);
        out
    }

    /// Parses the layout written by [`HybridCiphertext::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let expected = X25519_KEY_SIZE + mlkem1024::ciphertext_bytes();
        if bytes.len() != expected {
            return Err(PqmsgError::key_length(expected, bytes.len()));
        }
        let mut x25519_ephemeral = [0u8; X25519_KEY_SIZE];
        x25519_ephemeral.copy_from_slice(&bytes[..X25519_KEY_SIZE]);
        Ok(Self {
            x25519_ephemeral,
            mlkem: bytes[X25519_KEY_SIZE..].to_vec(),
        })
    }
}

fn combine(classical: &[u8; 32], post_quantum: &[u8]) -> Result<HybridSharedSecret> {
    let mut ikm = Vec::with_capacity(classical.len() + post_quantum.len());
    ikm.extend_from_slice(classical);
    ikm.extend_from_slice(post_quantum);

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; HYBRID_SECRET_SIZE];
    let expanded = hk.expand(HYBRID_KDF_INFO, &mut okm);
    ikm.zeroize();
    expanded.map_err(|_| PqmsgError::kem("Hybrid secret derivation failed"))?;

    Ok(HybridSharedSecret(okm))
}

/// Encapsulates a fresh shared secret to `peer`.
pub fn hybrid_encapsulate(peer: &HybridPublicKey) -> Result<(HybridSharedSecret, HybridCiphertext)> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let dh = ephemeral.diffie_hellman(&X25519Public::from(peer.x25519));
    if !dh.was_contributory() {
        return Err(PqmsgError::kem("Peer X25519 key is low order"));
    }

    let (kem_ss, kem_ct) = mlkem1024::encapsulate(&peer.as_mlkem()?);
    let secret = combine(dh.as_bytes(), kem_ss.as_bytes())?;

    Ok((
        secret,
        HybridCiphertext {
            x25519_ephemeral: ephemeral_public.to_bytes(),
            mlkem: kem_ct.as_bytes().to_vec(),
        },
    ))
}

/// Recovers the shared secret encapsulated to `keypair`.
///
/// ML-KEM decapsulation never fails outright; a tampered ciphertext yields an
/// unrelated secret, which later surfaces as an AEAD failure.
pub fn hybrid_decapsulate(
    keypair: &HybridKeyPair,
    ciphertext: &HybridCiphertext,
) -> Result<HybridSharedSecret> {
    let x_secret = StaticSecret::from(keypair.x25519_secret);
    let dh = x_secret.diffie_hellman(&X25519Public::from(ciphertext.x25519_ephemeral));
    if !dh.was_contributory() {
        return Err(PqmsgError::kem("Ephemeral X25519 key is low order"));
    }

    let kem_secret = mlkem1024::SecretKey::from_bytes(&keypair.mlkem_secret)
        .map_err(|_| PqmsgError::kem("Invalid ML-KEM secret key"))?;
    let kem_ct = mlkem1024::Ciphertext::from_bytes(&ciphertext.mlkem)
        .map_err(|_| PqmsgError::key_length(mlkem1024::ciphertext_bytes(), ciphertext.mlkem.len()))?;
    let kem_ss = mlkem1024::decapsulate(&kem_ct, &kem_secret);

    combine(dh.as_bytes(), kem_ss.as_bytes())
}
