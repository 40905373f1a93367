//! Ed25519 signatures for wake and delivery tokens.

use crate::error::{PqmsgError, Result};
use ed25519_dalek::{Signature, Signer};
use rand::rngs::OsRng;

pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Ed25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// Generates a fresh signing key.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Signs `data`, returning the 64-byte signature.
pub fn sign(signing_key: &SigningKey, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
    signing_key.sign(data).to_bytes()
}

/// Verifies `signature` over `data` under `public_key`.
///
/// Uses strict verification, which rejects malleable and small-order
/// encodings.
pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
    let public: [u8; PUBLIC_KEY_SIZE] = public_key
        .try_into()
        .map_err(|_| PqmsgError::key_length(PUBLIC_KEY_SIZE, public_key.len()))?;
    let verifying_key =
        VerifyingKey::from_bytes(&public).map_err(|_| PqmsgError::InvalidSignature)?;

    let sig_bytes: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| PqmsgError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(data, &signature)
        .map_err(|_| PqmsgError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let key = generate_signing_key();
        let sig = sign(&key, b"wake up");
        verify(key.verifying_key().as_bytes(), b"wake up", &sig).unwrap();
    }

    #[test]
    fn test_modified_data_rejected() {
        let key = generate_signing_key();
        let sig = sign(&key, b"wake up");
        assert!(matches!(
            verify(key.verifying_key().as_bytes(), b"wake up!", &sig),
            Err(PqmsgError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let key = generate_signing_key();
        let other = generate_signing_key();
        let sig = sign(&key, b"data");
        assert!(verify(other.verifying_key().as_bytes(), b"data", &sig).is_err());
    }

    #[test]
    fn test_bad_lengths() {
        let key = generate_signing_key();
        let sig = sign(&key, b"data");
        assert!(matches!(
            verify(&[0u8; 31], b"data", &sig),
            Err(PqmsgError::InvalidKeyLength { .. })
        ));
        assert!(matches!(
            verify(key.verifying_key().as_bytes(), b"data", &sig[..63]),
            Err(PqmsgError::InvalidSignature)
        ));
    }
}
