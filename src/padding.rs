//! Fixed-size padding and traffic shaping.
//!
//! Every packet leaving the session layer has the same length so an observer
//! on the transport learns nothing from sizes. The layout is
//!
//! ```text
//! [payload_len: u32 BE][payload][random fill]
//! ```
//!
//! Send timing is jittered with a truncated exponential delay, and cover
//! packets of random bytes can be emitted that are indistinguishable from
//! real ones without the ratchet keys.

use crate::error::{PqmsgError, Result};
use crate::validation::Validator;
use rand::{rngs::OsRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Default padded packet size in bytes.
pub const PADDED_SIZE: usize = 4096;

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Padding and delay settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaddingConfig {
    /// Exact size of every padded packet
    pub packet_size: usize,
    /// Lower bound of the send delay
    pub min_delay_ms: u64,
    /// Upper bound of the send delay
    pub max_delay_ms: u64,
    /// Mean of the send delay before truncation
    pub mean_delay_ms: u64,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            packet_size: PADDED_SIZE,
            min_delay_ms: 200,
            max_delay_ms: 800,
            mean_delay_ms: 300,
        }
    }
}

impl PaddingConfig {
    /// No send delay; for tests and local tooling.
    pub fn no_delay() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            mean_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.packet_size <= LENGTH_PREFIX_SIZE || self.packet_size > u32::MAX as usize {
            return Err(PqmsgError::config(format!(
                "Invalid padded packet size {}",
                self.packet_size
            )));
        }
        if self.min_delay_ms > self.mean_delay_ms || self.mean_delay_ms > self.max_delay_ms {
            return Err(PqmsgError::config(
                "Delay bounds must satisfy min <= mean <= max",
            ));
        }
        Ok(())
    }

    /// Largest payload that fits in one packet.
    pub fn max_payload(&self) -> usize {
        self.packet_size - LENGTH_PREFIX_SIZE
    }

    /// Pads `payload` to `packet_size`.
    pub fn pad(&self, payload: &[u8]) -> Result<Vec<u8>> {
        pad_to_size(payload, self.packet_size)
    }

    /// Inverse of [`PaddingConfig::pad`]. Packets of any other size are
    /// rejected before the length prefix is read.
    pub fn unpad(&self, packet: &[u8]) -> Result<Vec<u8>> {
        Validator::validate_packet_size(packet, self.packet_size)?;
        strip_padding(packet)
    }

    /// Samples a send delay in `[min_delay_ms, max_delay_ms]`.
    pub fn sample_delay_ms<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        let span = self.max_delay_ms.saturating_sub(self.min_delay_ms) as f64;
        let scale = self.mean_delay_ms.saturating_sub(self.min_delay_ms) as f64;
        if span == 0.0 || scale == 0.0 {
            return self.min_delay_ms;
        }

        // Inverse CDF of an exponential shifted to `min` and truncated at
        // `max`, so every sample lands in range without rejection.
        let cutoff = 1.0 - (-span / scale).exp();
        let u: f64 = rng.gen::<f64>() * cutoff;
        let offset = -scale * (1.0 - u).ln();
        let delay = self.min_delay_ms + offset.round() as u64;
        delay.clamp(self.min_delay_ms, self.max_delay_ms)
    }

    /// A packet of random bytes the same size as a real one.
    pub fn cover_packet(&self) -> Vec<u8> {
        let mut packet = vec![0u8; self.packet_size];
        OsRng.fill_bytes(&mut packet);
        packet
    }
}

/// Pads `payload` to exactly `target_size` bytes.
pub fn pad_to_size(payload: &[u8], target_size: usize) -> Result<Vec<u8>> {
    let needed = payload.len() + LENGTH_PREFIX_SIZE;
    if needed > target_size || payload.len() > u32::MAX as usize {
        return Err(PqmsgError::padding(format!(
            "Payload of {} bytes does not fit in a {} byte packet",
            payload.len(),
            target_size
        )));
    }

    let mut padded = Vec::with_capacity(target_size);
    padded.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    padded.extend_from_slice(payload);
    padded.resize(target_size, 0);
    OsRng.fill_bytes(&mut padded[needed..]);

    trace!(payload_len = payload.len(), target_size, "Padded packet");
    Ok(padded)
}

/// Pads `payload` to [`PADDED_SIZE`].
pub fn pad_to_fixed_size(payload: &[u8]) -> Result<Vec<u8>> {
    pad_to_size(payload, PADDED_SIZE)
}

/// Inverse of [`pad_to_size`].
pub fn strip_padding(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < LENGTH_PREFIX_SIZE {
        return Err(PqmsgError::padding("Packet shorter than length prefix"));
    }
    let (prefix, body) = padded.split_at(LENGTH_PREFIX_SIZE);
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    len_bytes.copy_from_slice(prefix);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;

    if payload_len > body.len() {
        return Err(PqmsgError::padding(format!(
            "Declared payload length {} exceeds packet body {}",
            payload_len,
            body.len()
        )));
    }
    Ok(body[..payload_len].to_vec())
}

/// Samples a send delay with the default bounds.
pub fn random_traffic_delay_ms() -> u64 {
    PaddingConfig::default().sample_delay_ms(&mut OsRng)
}

/// Random cover packet of [`PADDED_SIZE`] bytes.
pub fn generate_cover_packet() -> Vec<u8> {
    PaddingConfig::default().cover_packet()
}

/// Sleeps for a delay sampled from `config`; returns the delay applied.
pub async fn apply_traffic_delay(config: &PaddingConfig) -> Duration {
    let delay = Duration::from_millis(config.sample_delay_ms(&mut OsRng));
    tokio::time::sleep(delay).await;
    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_pad_roundtrip() {
        for len in [0usize, 1, 100, PADDED_SIZE - LENGTH_PREFIX_SIZE] {
            let payload = vec![0xA5; len];
            let padded = pad_to_fixed_size(&payload).unwrap();
            assert_eq!(padded.len(), PADDED_SIZE);
            assert_eq!(strip_padding(&padded).unwrap(), payload);
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; PADDED_SIZE - LENGTH_PREFIX_SIZE + 1];
        assert!(matches!(
            pad_to_fixed_size(&payload),
            Err(PqmsgError::Padding(_))
        ));
    }

    #[test]
    fn test_malformed_length_rejected() {
        assert!(strip_padding(&[0, 0]).is_err());

        let mut padded = pad_to_size(b"hello", 64).unwrap();
        padded[..4].copy_from_slice(&61u32.to_be_bytes());
        assert!(strip_padding(&padded).is_err());
        padded[..4].copy_from_slice(&60u32.to_be_bytes());
        assert_eq!(strip_padding(&padded).unwrap().len(), 60);
    }

    #[test]
    fn test_unpad_checks_size() {
        let config = PaddingConfig::no_delay();
        let packet = config.pad(b"payload").unwrap();
        assert_eq!(config.unpad(&packet).unwrap(), b"payload");
        assert!(matches!(
            config.unpad(&packet[..packet.len() - 1]),
            Err(PqmsgError::Validation(_))
        ));
    }

    #[test]
    fn test_fill_is_random() {
        let a = pad_to_size(b"x", 256).unwrap();
        let b = pad_to_size(b"x", 256).unwrap();
        assert_eq!(a[..5], b[..5]);
        assert_ne!(a[5..], b[5..]);
    }

    #[test]
    fn test_delay_bounds_and_mean() {
        let config = PaddingConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<u64> = (0..5_000).map(|_| config.sample_delay_ms(&mut rng)).collect();

        assert!(samples.iter().all(|d| (200..=800).contains(d)));
        let mean = samples.iter().sum::<u64>() as f64 / samples.len() as f64;
        // Truncation pulls the mean slightly below 300.
        assert!((270.0..=320.0).contains(&mean), "mean was {}", mean);
    }

    #[test]
    fn test_zero_delay_config() {
        let config = PaddingConfig::no_delay();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_delay_ms(&mut OsRng), 0);
    }

    #[test]
    fn test_cover_packet_shape() {
        let cover = generate_cover_packet();
        assert_eq!(cover.len(), PADDED_SIZE);
        assert_ne!(cover, generate_cover_packet());
    }

    #[test]
    fn test_config_validation() {
        assert!(PaddingConfig::default().validate().is_ok());
        let bad = PaddingConfig {
            mean_delay_ms: 900,
            ..PaddingConfig::default()
        };
        assert!(bad.validate().is_err());
        let tiny = PaddingConfig {
            packet_size: 4,
            ..PaddingConfig::default()
        };
        assert!(tiny.validate().is_err());
    }

    #[tokio::test]
    async fn test_apply_traffic_delay_uses_config() {
        let config = PaddingConfig {
            min_delay_ms: 5,
            max_delay_ms: 5,
            mean_delay_ms: 5,
            ..PaddingConfig::default()
        };
        assert_eq!(
            apply_traffic_delay(&config).await,
            Duration::from_millis(5)
        );
    }
}
