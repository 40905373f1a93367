//! Shared RocksDB helpers.
//!
//! Thin wrapper used by the ratchet store and the ping inbox: opening with
//! column families, bincode-encoded values, raw values, full scans and
//! atomic write batches. No domain logic lives here.

use crate::error::{PqmsgError, Result};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options,
    WriteBatch,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Configuration for RocksDB storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Maximum number of open files.
    pub max_open_files: i32,
    /// Number of log files to keep.
    pub keep_log_file_num: usize,
    /// Maximum WAL size in bytes.
    pub max_wal_size: u64,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Maximum number of write buffers.
    pub max_write_buffer_number: i32,
    /// Sync the WAL on every write.
    pub sync_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_open_files: 64,
            keep_log_file_num: 2,
            max_wal_size: 8 * 1024 * 1024,      // 8MB
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            max_write_buffer_number: 2,
            sync_writes: true,
        }
    }
}

impl RocksDbConfig {
    /// Small buffers and few files for phones and other constrained devices.
    pub fn for_mobile() -> Self {
        Self {
            max_open_files: 32,
            keep_log_file_num: 1,
            max_wal_size: 2 * 1024 * 1024,      // 2MB
            write_buffer_size: 1024 * 1024,     // 1MB
            max_write_buffer_number: 2,
            sync_writes: true,
        }
    }

    /// Builds RocksDB Options from this configuration.
    pub fn build_options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(self.max_open_files);
        opts.set_keep_log_file_num(self.keep_log_file_num);
        opts.set_max_total_wal_size(self.max_wal_size);
        opts.increase_parallelism(num_cpus::get().min(4) as i32);
        opts.set_write_buffer_size(self.write_buffer_size);
        opts.set_max_write_buffer_number(self.max_write_buffer_number);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }
}

/// A RocksDB database opened with a fixed set of column families.
pub struct RocksDbHandle {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    sync_writes: bool,
}

impl RocksDbHandle {
    /// Opens a RocksDB database with the given column families.
    pub fn open(
        db_path: impl AsRef<Path>,
        config: &RocksDbConfig,
        column_families: &[&str],
    ) -> Result<Self> {
        let opts = config.build_options();
        let cf_opts = Options::default();

        let cf_descriptors: Vec<_> = column_families
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(*cf, cf_opts.clone()))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &opts,
            db_path.as_ref(),
            cf_descriptors,
        )
        .map_err(|e| PqmsgError::storage(format!("Failed to open RocksDB: {}", e)))?;

        debug!(path = %db_path.as_ref().display(), ?column_families, "Opened RocksDB");
        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.sync_writes,
        })
    }

    /// Gets a column family handle.
    pub fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PqmsgError::storage(format!("Column family '{}' not found", name)))
    }

    fn write_options(&self) -> rocksdb::WriteOptions {
        let mut opts = rocksdb::WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    /// Stores a serializable value at the given key.
    pub fn put<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)
            .map_err(|e| PqmsgError::serialization(format!("Failed to serialize: {}", e)))?;
        self.put_raw(cf_name, key, &bytes)
    }

    /// Stores raw bytes at the given key.
    pub fn put_raw(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;

        trace!(
            cf = cf_name,
            key_len = key.len(),
            value_bytes = value.len(),
            "db_put_raw: storing raw bytes"
        );

        self.db
            .put_cf_opt(&cf, key, value, &self.write_options())
            .map_err(|e| PqmsgError::storage(format!("Failed to write: {}", e)))
    }

    /// Loads and deserializes a value from the given key.
    pub fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(cf_name, key)? {
            Some(bytes) => bincode::deserialize(&bytes).map(Some).map_err(|e| {
                PqmsgError::serialization(format!("Failed to deserialize: {}", e))
            }),
            None => Ok(None),
        }
    }

    /// Loads raw bytes from the given key.
    pub fn get_raw(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;

        match self.db.get_cf(&cf, key) {
            Ok(Some(bytes)) => {
                trace!(
                    cf = cf_name,
                    key_len = key.len(),
                    value_bytes = bytes.len(),
                    "db_get_raw: found record"
                );
                Ok(Some(bytes))
            }
            Ok(None) => {
                trace!(cf = cf_name, key_len = key.len(), "db_get_raw: key not found");
                Ok(None)
            }
            Err(e) => Err(PqmsgError::storage(format!("Failed to read: {}", e))),
        }
    }

    /// Deletes a key.
    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;

        trace!(cf = cf_name, key_len = key.len(), "db_delete: deleting key");

        self.db
            .delete_cf_opt(&cf, key, &self.write_options())
            .map_err(|e| PqmsgError::storage(format!("Failed to delete: {}", e)))
    }

    /// Deletes several keys in one atomic batch.
    pub fn delete_many(&self, cf_name: &str, keys: &[Vec<u8>]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let cf = self.cf(cf_name)?;
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete_cf(&cf, key);
        }
        self.db
            .write_opt(batch, &self.write_options())
            .map_err(|e| PqmsgError::storage(format!("Failed to delete batch: {}", e)))?;

        debug!(cf = cf_name, records_deleted = keys.len(), "db_delete_many");
        Ok(())
    }

    /// Iterates over all entries in a column family.
    ///
    /// The callback returns false to stop early.
    pub fn iterate_all<F>(&self, cf_name: &str, mut callback: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let cf = self.cf(cf_name)?;
        let iter = self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start);

        let mut count: usize = 0;
        for item in iter {
            match item {
                Ok((key, value)) => {
                    count += 1;
                    if !callback(&key, &value) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Iterator error: {}", e);
                }
            }
        }

        trace!(
            cf = cf_name,
            records_iterated = count,
            "db_iterate_all: completed full iteration"
        );

        Ok(())
    }

    /// Collects and deserializes every value in a column family. Records that
    /// fail to decode are skipped with a warning.
    pub fn collect_all<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let mut results = Vec::new();
        let mut errors: usize = 0;

        self.iterate_all(cf_name, |_, value| {
            match bincode::deserialize(value) {
                Ok(item) => results.push(item),
                Err(e) => {
                    errors += 1;
                    warn!("Failed to deserialize item: {}", e);
                }
            }
            true
        })?;

        debug!(
            cf = cf_name,
            records_collected = results.len(),
            deserialization_errors = errors,
            "db_collect_all: collected records"
        );
        Ok(results)
    }
}

impl std::fmt::Debug for RocksDbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbHandle")
            .field("db", &"RocksDB")
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}
