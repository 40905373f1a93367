//! Aggregate configuration.
//!
//! [`CoreConfig`] collects the tuning of every component so an application
//! can build it once and inject it. Defaults are production values;
//! [`CoreConfig::from_env`] applies `PQMSG_*` overrides on top.

use crate::ack::AckConfig;
use crate::error::{PqmsgError, Result};
use crate::padding::PaddingConfig;
use crate::ping::PingConfig;
use crate::ratchet::RatchetConfig;
use crate::replay::ReplayConfig;
use crate::storage::{RocksDbConfig, StorageConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

/// Every tunable of the messaging core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub ratchet: RatchetConfig,
    pub replay: ReplayConfig,
    pub ack: AckConfig,
    pub ping: PingConfig,
    pub padding: PaddingConfig,
    pub storage: StorageConfig,
}

impl CoreConfig {
    /// Small, fast settings for tests and the demo command: no send delay,
    /// short watchdog timings.
    pub fn for_testing() -> Self {
        Self {
            ack: AckConfig {
                retry_interval_ms: 1_000,
                max_attempts: 3,
            },
            ping: PingConfig {
                stuck_claim_threshold_ms: 1_000,
                watchdog_interval_ms: 100,
                ..PingConfig::default()
            },
            padding: PaddingConfig::no_delay(),
            ..Self::default()
        }
    }

    /// Settings for constrained devices.
    pub fn for_mobile() -> Self {
        Self {
            replay: ReplayConfig { capacity: 2_000 },
            storage: StorageConfig {
                rocksdb: RocksDbConfig::for_mobile(),
                ..StorageConfig::default()
            },
            ..Self::default()
        }
    }

    /// Defaults with overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults with overrides from `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        override_with(&lookup, "PQMSG_MAX_SKIP", &mut config.ratchet.max_skip)?;
        override_with(
            &lookup,
            "PQMSG_MAX_SKIPPED_KEYS",
            &mut config.ratchet.max_skipped_keys,
        )?;
        override_with(&lookup, "PQMSG_KEM_INTERVAL", &mut config.ratchet.kem_interval)?;
        override_with(&lookup, "PQMSG_REPLAY_CAPACITY", &mut config.replay.capacity)?;
        override_with(
            &lookup,
            "PQMSG_ACK_RETRY_INTERVAL_MS",
            &mut config.ack.retry_interval_ms,
        )?;
        override_with(&lookup, "PQMSG_ACK_MAX_ATTEMPTS", &mut config.ack.max_attempts)?;
        override_with(&lookup, "PQMSG_PING_MAX_RETRIES", &mut config.ping.max_retries)?;
        override_with(
            &lookup,
            "PQMSG_STUCK_CLAIM_MS",
            &mut config.ping.stuck_claim_threshold_ms,
        )?;
        override_with(
            &lookup,
            "PQMSG_WATCHDOG_INTERVAL_MS",
            &mut config.ping.watchdog_interval_ms,
        )?;
        override_with(
            &lookup,
            "PQMSG_MAX_PENDING_GLOBAL",
            &mut config.ping.max_pending_global,
        )?;
        override_with(
            &lookup,
            "PQMSG_MAX_PENDING_PER_CONTACT",
            &mut config.ping.max_pending_per_contact,
        )?;
        override_with(
            &lookup,
            "PQMSG_MAX_ACTIVE_GLOBAL",
            &mut config.ping.max_active_global,
        )?;
        override_with(
            &lookup,
            "PQMSG_MAX_ACTIVE_PER_CONTACT",
            &mut config.ping.max_active_per_contact,
        )?;
        override_with(&lookup, "PQMSG_PACKET_SIZE", &mut config.padding.packet_size)?;
        override_with(&lookup, "PQMSG_MIN_DELAY_MS", &mut config.padding.min_delay_ms)?;
        override_with(&lookup, "PQMSG_MAX_DELAY_MS", &mut config.padding.max_delay_ms)?;
        override_with(&lookup, "PQMSG_MEAN_DELAY_MS", &mut config.padding.mean_delay_ms)?;
        if let Some(path) = lookup("PQMSG_DATA_DIR") {
            config.storage.path = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects unusable or inconsistent values.
    pub fn validate(&self) -> Result<()> {
        self.ratchet.validate()?;
        self.ack.validate()?;
        self.ping.validate()?;
        self.padding.validate()?;
        if self.replay.capacity == 0 {
            return Err(PqmsgError::config("Replay capacity must be non-zero"));
        }
        if self.ping.stuck_claim_threshold_ms < self.ping.watchdog_interval_ms {
            return Err(PqmsgError::config(
                "Stuck-claim threshold shorter than the watchdog interval",
            ));
        }
        Ok(())
    }
}

fn override_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| PqmsgError::config(format!("{}={:?}: {}", name, raw, e)))?;
        debug!(name, "Config override applied");
    }
    Ok(())
}
