//! Encrypted-at-rest ratchet states.
//!
//! Each state is serialized with bincode and sealed with XChaCha20-Poly1305
//! under a [`StorageKey`]. The contact id is the associated data, so a blob
//! copied to another contact's slot fails to open. The Argon2id salt and a
//! key check value live in the `meta` column family.

use super::{RocksDbHandle, CF_META, CF_RATCHET_STATES};
use crate::crypto::password::{generate_salt, Password, StorageKey, SALT_SIZE};
use crate::error::{PqmsgError, Result};
use crate::ratchet::RatchetState;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SALT_KEY: &[u8] = b"storage_salt";
const KEY_CHECK_KEY: &[u8] = b"key_check";
const KEY_CHECK_PLAINTEXT: &[u8] = b"pqmsg-storage-key-check-v1";

/// Persistence boundary for ratchet states.
///
/// Callers save after every mutating ratchet operation, while still holding
/// the per-peer lock.
pub trait RatchetStore: Send + Sync {
    fn save(&self, contact_id: &str, state: &RatchetState) -> Result<()>;
    fn load(&self, contact_id: &str) -> Result<Option<RatchetState>>;
    /// Removes a contact's state.
    fn delete(&self, contact_id: &str) -> Result<()>;
    /// Contact ids with a stored state.
    fn contacts(&self) -> Result<Vec<String>>;
    /// Removes every stored state.
    fn wipe(&self) -> Result<usize> {
        let contacts = self.contacts()?;
        for contact_id in &contacts {
            self.delete(contact_id)?;
        }
        Ok(contacts.len())
    }
}

/// [`RatchetStore`] on RocksDB.
#[derive(Debug)]
pub struct RocksDbRatchetStore {
    db: Arc<RocksDbHandle>,
    key: StorageKey,
}

impl RocksDbRatchetStore {
    /// Derives the storage key from `password`, creating the salt on first
    /// use. A wrong password is rejected before any state is read.
    pub fn open(db: Arc<RocksDbHandle>, password: &Password) -> Result<Self> {
        let salt = match db.get_raw(CF_META, SALT_KEY)? {
            Some(bytes) => {
                let salt: [u8; SALT_SIZE] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| PqmsgError::storage("Corrupt storage salt"))?;
                salt
            }
            None => {
                let salt = generate_salt();
                db.put_raw(CF_META, SALT_KEY, &salt)?;
                info!("Initialized storage salt");
                salt
            }
        };

        let key = StorageKey::derive(password, &salt)?;
        Self::with_key(db, key)
    }

    /// Uses an already derived key.
    pub fn with_key(db: Arc<RocksDbHandle>, key: StorageKey) -> Result<Self> {
        match db.get_raw(CF_META, KEY_CHECK_KEY)? {
            Some(sealed) => {
                key.open(&sealed, KEY_CHECK_KEY)
                    .map_err(|_| PqmsgError::password("Wrong storage password"))?;
            }
            None => {
                let sealed = key.seal(KEY_CHECK_PLAINTEXT, KEY_CHECK_KEY)?;
                db.put_raw(CF_META, KEY_CHECK_KEY, &sealed)?;
            }
        }
        Ok(Self { db, key })
    }
}

impl RatchetStore for RocksDbRatchetStore {
    fn save(&self, contact_id: &str, state: &RatchetState) -> Result<()> {
        let plaintext = state.to_bytes()?;
        let sealed = self.key.seal(&plaintext, contact_id.as_bytes())?;
        self.db
            .put_raw(CF_RATCHET_STATES, contact_id.as_bytes(), &sealed)?;
        debug!(
            contact_id,
            generation = state.generation(),
            "Saved ratchet state"
        );
        Ok(())
    }

    fn load(&self, contact_id: &str) -> Result<Option<RatchetState>> {
        let Some(sealed) = self.db.get_raw(CF_RATCHET_STATES, contact_id.as_bytes())? else {
            return Ok(None);
        };
        let plaintext = zeroize::Zeroizing::new(
            self.key
                .open(&sealed, contact_id.as_bytes())
                .map_err(|_| {
                    warn!(contact_id, "Stored ratchet state failed authentication");
                    PqmsgError::storage(format!("Corrupt ratchet state for {}", contact_id))
                })?,
        );
        RatchetState::from_bytes(&plaintext).map(Some)
    }

    fn delete(&self, contact_id: &str) -> Result<()> {
        self.db.delete(CF_RATCHET_STATES, contact_id.as_bytes())?;
        info!(contact_id, "Deleted ratchet state");
        Ok(())
    }

    fn contacts(&self) -> Result<Vec<String>> {
        let mut contacts = Vec::new();
        self.db.iterate_all(CF_RATCHET_STATES, |key, _| {
            match std::str::from_utf8(key) {
                Ok(id) => contacts.push(id.to_string()),
                Err(_) => warn!("Skipping non-UTF-8 contact key"),
            }
            true
        })?;
        Ok(contacts)
    }
}
