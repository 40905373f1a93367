//! Ping inbox on RocksDB.
//!
//! RocksDB has no conditional update, so every read-check-write runs under a
//! process-wide write lock. Reads that do not decide a transition skip the
//! lock. The database must not be shared with another process.

use super::{RocksDbHandle, CF_PING_INBOX};
use crate::error::Result;
use crate::ping::{InsertOutcome, PingInbox, PingInboxEntry};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Durable [`PingInbox`].
#[derive(Debug)]
pub struct RocksDbPingInbox {
    db: Arc<RocksDbHandle>,
    write_lock: Mutex<()>,
}

impl RocksDbPingInbox {
    pub fn new(db: Arc<RocksDbHandle>) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self, ping_id: &str) -> Result<Option<PingInboxEntry>> {
        self.db.get(CF_PING_INBOX, ping_id.as_bytes())
    }

    fn store(&self, entry: &PingInboxEntry) -> Result<()> {
        self.db.put(CF_PING_INBOX, entry.ping_id.as_bytes(), entry)
    }
}

impl PingInbox for RocksDbPingInbox {
    fn insert_or_touch(
        &self,
        ping_id: &str,
        contact_id: &str,
        wire_bytes: Option<Vec<u8>>,
        now_ms: u64,
    ) -> Result<InsertOutcome> {
        let _guard = self.write_lock.lock().unwrap();
        if let Some(mut existing) = self.load(ping_id)? {
            existing.touch(now_ms);
            self.store(&existing)?;
            debug!(ping_id, seen_count = existing.seen_count, "Duplicate ping");
            return Ok(InsertOutcome::Duplicate {
                seen_count: existing.seen_count,
                state: existing.state,
            });
        }

        self.store(&PingInboxEntry::new(ping_id, contact_id, wire_bytes, now_ms))?;
        debug!(ping_id, contact_id, "New ping");
        Ok(InsertOutcome::Inserted)
    }

    fn get(&self, ping_id: &str) -> Result<Option<PingInboxEntry>> {
        self.load(ping_id)
    }

    fn update_if(
        &self,
        ping_id: &str,
        update: &mut dyn FnMut(&mut PingInboxEntry) -> bool,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut entry) = self.load(ping_id)? else {
            return Ok(0);
        };
        if !update(&mut entry) {
            return Ok(0);
        }
        self.store(&entry)?;
        Ok(1)
    }

    fn entries(&self) -> Result<Vec<PingInboxEntry>> {
        self.db.collect_all(CF_PING_INBOX)
    }

    fn remove_where(
        &self,
        predicate: &dyn Fn(&PingInboxEntry) -> bool,
    ) -> Result<Vec<PingInboxEntry>> {
        let _guard = self.write_lock.lock().unwrap();
        let doomed: Vec<PingInboxEntry> = self
            .db
            .collect_all::<PingInboxEntry>(CF_PING_INBOX)?
            .into_iter()
            .filter(|entry| predicate(entry))
            .collect();
        let keys: Vec<Vec<u8>> = doomed
            .iter()
            .map(|entry| entry.ping_id.as_bytes().to_vec())
            .collect();
        self.db.delete_many(CF_PING_INBOX, &keys)?;
        Ok(doomed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ping::{FailureOutcome, PingConfig, PingState};
    use crate::storage::{open_database, RocksDbConfig};
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn inbox() -> (RocksDbPingInbox, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = open_database(temp.path(), &RocksDbConfig::default()).unwrap();
        (RocksDbPingInbox::new(db), temp)
    }

    #[test]
    fn test_lifecycle_persists() {
        let temp = TempDir::new().unwrap();
        {
            let db = open_database(temp.path(), &RocksDbConfig::default()).unwrap();
            let inbox = RocksDbPingInbox::new(db);
            inbox
                .insert_or_touch("p1", "alice", Some(vec![1, 2, 3]), 10)
                .unwrap();
            assert_eq!(inbox.claim_for_download("p1", 20).unwrap(), 1);
        }

        let db = open_database(temp.path(), &RocksDbConfig::default()).unwrap();
        let inbox = RocksDbPingInbox::new(db);
        let entry = inbox.get("p1").unwrap().unwrap();
        assert_eq!(entry.state, PingState::DownloadQueued);
        assert_eq!(entry.claimed_at, Some(20));
        assert_eq!(entry.wire_bytes, Some(vec![1, 2, 3]));

        assert_eq!(inbox.mark_stored("p1", 30).unwrap(), 1);
        assert_eq!(inbox.claim_for_download("p1", 40).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_insert() {
        let (inbox, _temp) = inbox();
        inbox.insert_or_touch("p1", "alice", None, 0).unwrap();
        assert_eq!(
            inbox.insert_or_touch("p1", "alice", None, 5).unwrap(),
            InsertOutcome::Duplicate {
                seen_count: 2,
                state: PingState::PingSeen
            }
        );
        assert_eq!(inbox.entries().unwrap().len(), 1);
        assert_eq!(inbox.get("p1").unwrap().unwrap().attempt_count, 0);
    }

    #[test]
    fn test_concurrent_claim_has_one_winner() {
        let (inbox, _temp) = inbox();
        let inbox = Arc::new(inbox);
        for round in 0..20 {
            let ping_id = format!("p{}", round);
            inbox.insert_or_touch(&ping_id, "alice", None, 0).unwrap();
            let barrier = Arc::new(Barrier::new(4));

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let inbox = Arc::clone(&inbox);
                    let barrier = Arc::clone(&barrier);
                    let ping_id = ping_id.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        inbox.claim_for_download(&ping_id, 1).unwrap()
                    })
                })
                .collect();

            let rows: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(rows, 1);
        }
    }

    #[test]
    fn test_failure_and_cleanup() {
        let (inbox, _temp) = inbox();
        let config = PingConfig {
            max_retries: 1,
            stored_retention_ms: 100,
            ..PingConfig::default()
        };
        inbox.insert_or_touch("fail", "alice", None, 0).unwrap();
        inbox.insert_or_touch("done", "alice", None, 0).unwrap();
        inbox.claim_for_download("fail", 0).unwrap();
        inbox.claim_for_download("done", 0).unwrap();
        inbox.mark_stored("done", 0).unwrap();

        assert_eq!(
            inbox.record_failure("fail", config.max_retries, 1).unwrap(),
            FailureOutcome::ManualRequired { attempt_count: 1 }
        );

        let report = inbox.cleanup(&config, 100).unwrap();
        assert_eq!(report.msg_stored, 1);
        assert!(inbox.get("done").unwrap().is_none());
        assert_eq!(
            inbox.get("fail").unwrap().unwrap().state,
            PingState::ManualRequired
        );
        assert_eq!(inbox.pressure().unwrap().global.manual_required, 1);
    }
}
