//! Constant-time comparisons for secret-dependent values.
//!
//! Every comparison of keys, tags, MACs or identity bytes in this crate goes
//! through these helpers so that the running time does not depend on where
//! two inputs first differ.

use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};
use zeroize::Zeroize;

/// Constant-time utilities for security-critical comparisons.
pub struct TimingSafe;

impl TimingSafe {
    /// Constant-time comparison of byte slices.
    ///
    /// Slices of different length compare unequal. The length itself is not
    /// treated as secret.
    pub fn bytes_equal(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        a.ct_eq(b).into()
    }

    /// Constant-time comparison of fixed-size arrays (keys, fingerprints).
    pub fn array_equal<const N: usize>(a: &[u8; N], b: &[u8; N]) -> bool {
        a.ct_eq(b).into()
    }

    /// Constant-time comparison that also hides the input lengths.
    ///
    /// Both inputs are copied into zero-padded buffers of `max_len` bytes;
    /// the length check is folded into the result without branching.
    pub fn bytes_equal_padded(a: &[u8], b: &[u8], max_len: usize) -> bool {
        let mut padded_a = vec![0u8; max_len];
        let mut padded_b = vec![0u8; max_len];

        let a_len = a.len().min(max_len);
        let b_len = b.len().min(max_len);

        padded_a[..a_len].copy_from_slice(&a[..a_len]);
        padded_b[..b_len].copy_from_slice(&b[..b_len]);

        let lengths_match = Choice::from((a.len() == b.len()) as u8);
        let contents_match = padded_a.ct_eq(&padded_b);

        padded_a.zeroize();
        padded_b.zeroize();

        (lengths_match & contents_match).into()
    }

    /// Constant-time comparison of identifiers such as onion addresses.
    pub fn string_equal(a: &str, b: &str) -> bool {
        Self::bytes_equal(a.as_bytes(), b.as_bytes())
    }

    /// Constant-time selection between two values.
    pub fn select_u64(condition: bool, true_val: u64, false_val: u64) -> u64 {
        u64::conditional_select(&false_val, &true_val, Choice::from(condition as u8))
    }
}
