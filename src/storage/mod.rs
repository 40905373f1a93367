//! Persistence for ratchet states and the ping inbox.
//!
//! ## Modules
//!
//! - `rocksdb`: generic RocksDB helpers (configuration, handle, batches)
//! - `ratchet_store`: ratchet states sealed under a password-derived key
//! - `ping_store`: ping inbox with serialized conditional updates
//!
//! Both stores share one database opened by [`open_database`].

pub mod ping_store;
pub mod ratchet_store;
pub mod rocksdb;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use ping_store::RocksDbPingInbox;
pub use ratchet_store::{RatchetStore, RocksDbRatchetStore};
pub use rocksdb::{RocksDbConfig, RocksDbHandle};

/// Sealed ratchet states keyed by contact id.
pub const CF_RATCHET_STATES: &str = "ratchet_states";
/// Ping inbox entries keyed by ping id.
pub const CF_PING_INBOX: &str = "ping_inbox";
/// Salt and key check value.
pub const CF_META: &str = "meta";

/// Every column family the core uses.
pub const COLUMN_FAMILIES: &[&str] = &[CF_RATCHET_STATES, CF_PING_INBOX, CF_META];

/// Where and how to open the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub rocksdb: RocksDbConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pqmsg_data"),
            rocksdb: RocksDbConfig::default(),
        }
    }
}

/// Opens the database with every column family the core needs.
pub fn open_database(path: impl AsRef<Path>, config: &RocksDbConfig) -> Result<Arc<RocksDbHandle>> {
    RocksDbHandle::open(path, config, COLUMN_FAMILIES).map(Arc::new)
}
