//! BLAKE3 hashing helpers.

/// Size of a fingerprint in bytes.
pub const FINGERPRINT_SIZE: usize = 32;

/// Keyed BLAKE3 fingerprint of `data` within `scope`.
///
/// The scope is length-prefixed so that `("ab", "c")` and `("a", "bc")`
/// never produce the same input.
pub fn keyed_fingerprint(
    key: &[u8; FINGERPRINT_SIZE],
    scope: &[u8],
    data: &[u8],
) -> [u8; FINGERPRINT_SIZE] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(&(scope.len() as u64).to_be_bytes());
    hasher.update(scope);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Unkeyed BLAKE3 digest.
pub fn hash_data(data: &[u8]) -> [u8; FINGERPRINT_SIZE] {
    *blake3::hash(data).as_bytes()
}
