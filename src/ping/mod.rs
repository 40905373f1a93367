//! Ping/pong wake protocol.
//!
//! A ping tells the recipient that a payload is waiting. Every inbound ping
//! becomes a [`PingInboxEntry`] that moves through a closed set of states:
//!
//! ```text
//! PingSeen(0) ──► PongSent(1) ─────────┐
//!     │               ▲                ▼
//!     └──► DownloadQueued(10) ──► MsgStored(2)
//!               │  ▲
//!               ▼  │ (reclaim / retry)
//!      FailedTemp(11) / ManualRequired(12)
//! ```
//!
//! Every transition is a compare-and-swap guarded by the expected source
//! states and reports how many rows it changed (0 or 1). When several workers
//! race for the same entry exactly one wins; the others see 0 rows and drop
//! the work.

pub mod handler;
pub mod memory;
pub mod policy;
pub mod token;
pub mod watchdog;

use crate::error::{PqmsgError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

pub use handler::{InboundPing, WakeHandler};
pub use memory::MemoryPingInbox;
pub use policy::{AutoDownloadPolicy, ClaimDecision, DeferReason, TransportHealth};
pub use token::{DeliveryAck, PingToken, PongToken};
pub use watchdog::{SweepReport, Watchdog};

/// State of an inbound wake signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PingState {
    PingSeen = 0,
    PongSent = 1,
    MsgStored = 2,
    DownloadQueued = 10,
    FailedTemp = 11,
    ManualRequired = 12,
}

impl PingState {
    /// Stable integer code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parses a stable integer code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::PingSeen),
            1 => Ok(Self::PongSent),
            2 => Ok(Self::MsgStored),
            10 => Ok(Self::DownloadQueued),
            11 => Ok(Self::FailedTemp),
            12 => Ok(Self::ManualRequired),
            other => Err(PqmsgError::validation(format!(
                "Unknown ping state code {}",
                other
            ))),
        }
    }

    /// Whether entries in this state count toward pending pressure.
    pub fn counts_toward_pressure(self) -> bool {
        matches!(
            self,
            Self::PingSeen | Self::DownloadQueued | Self::FailedTemp
        )
    }
}

impl fmt::Display for PingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PingSeen => "PING_SEEN",
            Self::PongSent => "PONG_SENT",
            Self::MsgStored => "MSG_STORED",
            Self::DownloadQueued => "DOWNLOAD_QUEUED",
            Self::FailedTemp => "FAILED_TEMP",
            Self::ManualRequired => "MANUAL_REQUIRED",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// Source states accepted by each transition.
pub mod guards {
    use super::PingState::{self, *};

    pub const PONG_SENT_FROM: &[PingState] = &[PingSeen, DownloadQueued];
    pub const CLAIM_FROM: &[PingState] = &[PingSeen, ManualRequired, FailedTemp, PongSent];
    pub const STORED_FROM: &[PingState] = &[DownloadQueued, PongSent];
    pub const FAILURE_FROM: &[PingState] = &[DownloadQueued, PongSent];
}

/// Ping inbox tuning. All durations are monotonic milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingConfig {
    /// Failures after which an entry needs manual action
    pub max_retries: u32,
    /// Age of a download claim after which the watchdog reclaims it
    pub stuck_claim_threshold_ms: u64,
    /// Pause between watchdog sweeps
    pub watchdog_interval_ms: u64,
    /// Retention of `MsgStored` entries
    pub stored_retention_ms: u64,
    /// Retention of never-claimed `PingSeen` entries
    pub abandoned_ping_ms: u64,
    /// Retention of `PongSent` entries whose payload never arrived
    pub pong_window_ms: u64,
    /// Maximum age of a signed token
    pub token_max_age_secs: u64,
    /// Pending entries (`PingSeen`, `DownloadQueued`, `FailedTemp`) allowed
    /// across all contacts before automatic downloads stop
    pub max_pending_global: usize,
    /// Pending entries allowed for one contact before its automatic
    /// downloads stop
    pub max_pending_per_contact: usize,
    /// Concurrent `DownloadQueued` claims across all contacts
    pub max_active_global: usize,
    /// Concurrent `DownloadQueued` claims for one contact
    pub max_active_per_contact: usize,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            stuck_claim_threshold_ms: 2 * 60 * 1000,
            watchdog_interval_ms: 30 * 1000,
            stored_retention_ms: 24 * 60 * 60 * 1000,
            abandoned_ping_ms: 7 * 24 * 60 * 60 * 1000,
            pong_window_ms: 60 * 60 * 1000,
            token_max_age_secs: 5 * 60,
            max_pending_global: 64,
            max_pending_per_contact: 8,
            max_active_global: 16,
            max_active_per_contact: 4,
        }
    }
}

impl PingConfig {
    /// Checks that the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(PqmsgError::config("max_retries must be at least 1"));
        }
        if self.stuck_claim_threshold_ms == 0 || self.watchdog_interval_ms == 0 {
            return Err(PqmsgError::config("Watchdog timings must be non-zero"));
        }
        if self.abandoned_ping_ms < self.stored_retention_ms {
            return Err(PqmsgError::config(
                "Abandoned ping window must not be shorter than stored retention",
            ));
        }
        if self.max_pending_per_contact > self.max_pending_global
            || self.max_active_per_contact > self.max_active_global
        {
            return Err(PqmsgError::config(
                "Per-contact pressure limit exceeds global limit",
            ));
        }
        if self.max_active_per_contact == 0 {
            return Err(PqmsgError::config("Active download limit must be non-zero"));
        }
        Ok(())
    }
}

/// One inbound wake signal awaiting resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInboxEntry {
    pub ping_id: String,
    pub contact_id: String,
    pub state: PingState,
    /// Failed download attempts; drives the retry ceiling
    pub attempt_count: u32,
    /// Arrivals of this ping, the first included
    pub seen_count: u32,
    pub first_seen_at: u64,
    pub last_updated_at: u64,
    pub claimed_at: Option<u64>,
    pub wire_bytes: Option<Vec<u8>>,
}

impl PingInboxEntry {
    /// Creates an entry in `PingSeen`.
    pub fn new(ping_id: &str, contact_id: &str, wire_bytes: Option<Vec<u8>>, now_ms: u64) -> Self {
        Self {
            ping_id: ping_id.to_string(),
            contact_id: contact_id.to_string(),
            state: PingState::PingSeen,
            attempt_count: 0,
            seen_count: 1,
            first_seen_at: now_ms,
            last_updated_at: now_ms,
            claimed_at: None,
            wire_bytes,
        }
    }

    /// Records a repeated arrival. Leaves the state and the failure count
    /// alone.
    pub fn touch(&mut self, now_ms: u64) {
        self.seen_count = self.seen_count.saturating_add(1);
        self.last_updated_at = now_ms;
    }

    /// Moves to `to` if the current state is one of `from`.
    ///
    /// Entering `DownloadQueued` records the claim time; every other target
    /// clears it.
    pub fn try_transition(&mut self, from: &[PingState], to: PingState, now_ms: u64) -> bool {
        if !from.contains(&self.state) {
            return false;
        }
        self.state = to;
        self.last_updated_at = now_ms;
        self.claimed_at = match to {
            PingState::DownloadQueued => Some(now_ms),
            _ => None,
        };
        true
    }

    /// Records one failed delivery attempt and decides, in the same step,
    /// whether the entry stays retryable.
    pub fn try_fail(&mut self, max_retries: u32, now_ms: u64) -> FailureOutcome {
        if !guards::FAILURE_FROM.contains(&self.state) {
            return FailureOutcome::NotApplied;
        }
        let attempts = self.attempt_count.saturating_add(1);
        let to = if attempts >= max_retries {
            PingState::ManualRequired
        } else {
            PingState::FailedTemp
        };
        self.attempt_count = attempts;
        self.state = to;
        self.last_updated_at = now_ms;
        self.claimed_at = None;

        match to {
            PingState::ManualRequired => FailureOutcome::ManualRequired {
                attempt_count: attempts,
            },
            _ => FailureOutcome::FailedTemp {
                attempt_count: attempts,
            },
        }
    }

    /// Returns true if the entry holds a download claim older than
    /// `threshold_ms`.
    pub fn is_stuck(&self, threshold_ms: u64, now_ms: u64) -> bool {
        self.state == PingState::DownloadQueued
            && self
                .claimed_at
                .is_some_and(|claimed| now_ms.saturating_sub(claimed) >= threshold_ms)
    }

    /// Returns true if cleanup should purge this entry.
    pub fn is_expired(&self, config: &PingConfig, now_ms: u64) -> bool {
        let age = now_ms.saturating_sub(self.last_updated_at);
        match self.state {
            PingState::MsgStored => age >= config.stored_retention_ms,
            PingState::PingSeen => age >= config.abandoned_ping_ms,
            PingState::PongSent => age >= config.pong_window_ms,
            _ => false,
        }
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First sighting of this ping
    Inserted,
    /// Already known; only the arrival counter and timestamp moved
    Duplicate { seen_count: u32, state: PingState },
}

/// Result of the atomic failure decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The entry was not in a state that accepts a failure (0 rows)
    NotApplied,
    /// Retryable failure
    FailedTemp { attempt_count: u32 },
    /// Retries exhausted, user action required
    ManualRequired { attempt_count: u32 },
}

impl FailureOutcome {
    /// Rows affected, as reported by a conditional update.
    pub fn rows(&self) -> usize {
        match self {
            Self::NotApplied => 0,
            _ => 1,
        }
    }
}

/// Counts of entries per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPressure {
    pub ping_seen: usize,
    pub pong_sent: usize,
    pub msg_stored: usize,
    pub download_queued: usize,
    pub failed_temp: usize,
    pub manual_required: usize,
}

impl PingPressure {
    fn add(&mut self, state: PingState) {
        match state {
            PingState::PingSeen => self.ping_seen += 1,
            PingState::PongSent => self.pong_sent += 1,
            PingState::MsgStored => self.msg_stored += 1,
            PingState::DownloadQueued => self.download_queued += 1,
            PingState::FailedTemp => self.failed_temp += 1,
            PingState::ManualRequired => self.manual_required += 1,
        }
    }

    /// Entries that still hold automatic work.
    pub fn pending(&self) -> usize {
        self.ping_seen + self.download_queued + self.failed_temp
    }
}

/// Global and per-contact pressure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PressureReport {
    pub global: PingPressure,
    pub per_contact: HashMap<String, PingPressure>,
}

impl PressureReport {
    /// Tallies `entries`.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a PingInboxEntry>) -> Self {
        let mut report = Self::default();
        for entry in entries {
            report.global.add(entry.state);
            report
                .per_contact
                .entry(entry.contact_id.clone())
                .or_default()
                .add(entry.state);
        }
        report
    }

    /// Pending pressure for one contact.
    pub fn pending_for(&self, contact_id: &str) -> usize {
        self.per_contact
            .get(contact_id)
            .map(PingPressure::pending)
            .unwrap_or(0)
    }
}

/// Rows removed by one cleanup pass, by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub msg_stored: usize,
    pub ping_seen: usize,
    pub pong_sent: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.msg_stored + self.ping_seen + self.pong_sent
    }
}

/// Persistent set of ping inbox entries with atomic conditional updates.
///
/// Implementations provide four primitives, each atomic with respect to
/// every other call on the same inbox. The protocol transitions are built on
/// top of [`PingInbox::update_if`].
pub trait PingInbox: Send + Sync {
    /// Inserts a new entry in `PingSeen`, or bumps `seen_count` and
    /// `last_updated_at` of an existing one.
    fn insert_or_touch(
        &self,
        ping_id: &str,
        contact_id: &str,
        wire_bytes: Option<Vec<u8>>,
        now_ms: u64,
    ) -> Result<InsertOutcome>;

    /// Reads one entry.
    fn get(&self, ping_id: &str) -> Result<Option<PingInboxEntry>>;

    /// Applies `update` to the entry under the inbox lock and persists it if
    /// `update` returns true. Returns rows affected.
    fn update_if(
        &self,
        ping_id: &str,
        update: &mut dyn FnMut(&mut PingInboxEntry) -> bool,
    ) -> Result<usize>;

    /// Snapshot of all entries.
    fn entries(&self) -> Result<Vec<PingInboxEntry>>;

    /// Deletes every entry matching `predicate`; returns the deleted entries.
    fn remove_where(
        &self,
        predicate: &dyn Fn(&PingInboxEntry) -> bool,
    ) -> Result<Vec<PingInboxEntry>>;

    /// `PingSeen | DownloadQueued -> PongSent`.
    fn mark_pong_sent(&self, ping_id: &str, now_ms: u64) -> Result<usize> {
        let rows = self.update_if(ping_id, &mut |entry| {
            entry.try_transition(guards::PONG_SENT_FROM, PingState::PongSent, now_ms)
        })?;
        debug!(ping_id, rows, "mark_pong_sent");
        Ok(rows)
    }

    /// Atomic download claim:
    /// `PingSeen | ManualRequired | FailedTemp | PongSent -> DownloadQueued`.
    fn claim_for_download(&self, ping_id: &str, now_ms: u64) -> Result<usize> {
        let rows = self.update_if(ping_id, &mut |entry| {
            entry.try_transition(guards::CLAIM_FROM, PingState::DownloadQueued, now_ms)
        })?;
        debug!(ping_id, rows, "claim_for_download");
        Ok(rows)
    }

    /// `DownloadQueued | PongSent -> MsgStored`. Never moves backwards.
    fn mark_stored(&self, ping_id: &str, now_ms: u64) -> Result<usize> {
        let rows = self.update_if(ping_id, &mut |entry| {
            entry.try_transition(guards::STORED_FROM, PingState::MsgStored, now_ms)
        })?;
        if rows == 1 {
            info!(ping_id, "Payload stored");
        }
        Ok(rows)
    }

    /// `DownloadQueued | PongSent -> FailedTemp | ManualRequired`, decided
    /// in the same atomic step on `attempt_count + 1 >= max_retries`.
    fn record_failure(&self, ping_id: &str, max_retries: u32, now_ms: u64) -> Result<FailureOutcome> {
        let mut outcome = FailureOutcome::NotApplied;
        self.update_if(ping_id, &mut |entry| {
            outcome = entry.try_fail(max_retries, now_ms);
            outcome != FailureOutcome::NotApplied
        })?;
        match outcome {
            FailureOutcome::ManualRequired { attempt_count } => {
                warn!(ping_id, attempt_count, "Retries exhausted, manual download required")
            }
            FailureOutcome::FailedTemp { attempt_count } => {
                debug!(ping_id, attempt_count, "Download failed, will retry")
            }
            FailureOutcome::NotApplied => debug!(ping_id, "Failure decision lost"),
        }
        Ok(outcome)
    }

    /// Applies the failure decision to one entry only if it is still stuck.
    fn reclaim_if_stuck(
        &self,
        ping_id: &str,
        config: &PingConfig,
        now_ms: u64,
    ) -> Result<FailureOutcome> {
        let mut outcome = FailureOutcome::NotApplied;
        self.update_if(ping_id, &mut |entry| {
            if !entry.is_stuck(config.stuck_claim_threshold_ms, now_ms) {
                return false;
            }
            outcome = entry.try_fail(config.max_retries, now_ms);
            outcome != FailureOutcome::NotApplied
        })?;
        Ok(outcome)
    }

    /// Pending pressure, globally and per contact.
    fn pressure(&self) -> Result<PressureReport> {
        Ok(PressureReport::from_entries(&self.entries()?))
    }

    /// Purges entries past their state's retention window.
    fn cleanup(&self, config: &PingConfig, now_ms: u64) -> Result<CleanupReport> {
        let removed = self.remove_where(&|entry| entry.is_expired(config, now_ms))?;
        let mut report = CleanupReport::default();
        for entry in &removed {
            match entry.state {
                PingState::MsgStored => report.msg_stored += 1,
                PingState::PingSeen => report.ping_seen += 1,
                PingState::PongSent => report.pong_sent += 1,
                _ => {}
            }
        }
        if report.total() > 0 {
            info!(
                msg_stored = report.msg_stored,
                ping_seen = report.ping_seen,
                pong_sent = report.pong_sent,
                "Ping inbox cleanup"
            );
        }
        Ok(report)
    }
}

/// Converts a 0-row result into [`PqmsgError::ClaimLost`].
pub fn require_row(rows: usize, ping_id: &str) -> Result<()> {
    if rows == 0 {
        return Err(PqmsgError::ClaimLost(ping_id.to_string()));
    }
    Ok(())
}
