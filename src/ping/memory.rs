//! In-memory ping inbox.

use super::{InsertOutcome, PingInbox, PingInboxEntry};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Ping inbox held in a `Mutex<HashMap>`; every primitive runs under the
/// lock, which makes each conditional update atomic.
#[derive(Debug, Default)]
pub struct MemoryPingInbox {
    entries: Mutex<HashMap<String, PingInboxEntry>>,
}

impl MemoryPingInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PingInbox for MemoryPingInbox {
    fn insert_or_touch(
        &self,
        ping_id: &str,
        contact_id: &str,
        wire_bytes: Option<Vec<u8>>,
        now_ms: u64,
    ) -> Result<InsertOutcome> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get_mut(ping_id) {
            existing.touch(now_ms);
            debug!(ping_id, seen_count = existing.seen_count, "Duplicate ping");
            return Ok(InsertOutcome::Duplicate {
                seen_count: existing.seen_count,
                state: existing.state,
            });
        }

        entries.insert(
            ping_id.to_string(),
            PingInboxEntry::new(ping_id, contact_id, wire_bytes, now_ms),
        );
        debug!(ping_id, contact_id, "New ping");
        Ok(InsertOutcome::Inserted)
    }

    fn get(&self, ping_id: &str) -> Result<Option<PingInboxEntry>> {
        Ok(self.entries.lock().unwrap().get(ping_id).cloned())
    }

    fn update_if(
        &self,
        ping_id: &str,
        update: &mut dyn FnMut(&mut PingInboxEntry) -> bool,
    ) -> Result<usize> {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(ping_id) else {
            return Ok(0);
        };

        // Work on a copy so a rejected update leaves no trace.
        let mut candidate = entry.clone();
        if !update(&mut candidate) {
            return Ok(0);
        }
        *entry = candidate;
        Ok(1)
    }

    fn entries(&self) -> Result<Vec<PingInboxEntry>> {
        Ok(self.entries.lock().unwrap().values().cloned().collect())
    }

    fn remove_where(
        &self,
        predicate: &dyn Fn(&PingInboxEntry) -> bool,
    ) -> Result<Vec<PingInboxEntry>> {
        let mut entries = self.entries.lock().unwrap();
        let doomed: Vec<String> = entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.ping_id.clone())
            .collect();
        Ok(doomed
            .iter()
            .filter_map(|ping_id| entries.remove(ping_id))
            .collect())
    }
}
