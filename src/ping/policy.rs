//! Auto-download admission.
//!
//! Before claiming a ping for automatic download the caller asks the policy,
//! which weighs pending pressure and the current transport health. A flood of
//! wake signals from one contact therefore cannot queue unbounded work.

use super::{PingConfig, PingInbox, PressureReport};
use crate::error::{PqmsgError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Snapshot of the transport's health, supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportHealth {
    /// Circuits are up and recent sends succeeded
    Healthy,
    /// Reachable but slow or flapping; the global budget is halved
    Degraded,
    /// No usable circuits
    Offline,
}

/// Why a claim was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    TransportOffline,
    GlobalPressure,
    ContactPressure,
}

/// Outcome of [`AutoDownloadPolicy::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDecision {
    /// This caller now owns the download
    Claimed,
    /// Leave the ping for later
    Deferred(DeferReason),
}

/// Decides whether a ping may be claimed for automatic download.
#[derive(Debug, Clone)]
pub struct AutoDownloadPolicy {
    config: PingConfig,
}

impl AutoDownloadPolicy {
    pub fn new(config: PingConfig) -> Self {
        Self { config }
    }

    /// Evaluates admission without touching the inbox.
    ///
    /// Deferral happens when active claims reach their limit or when pending
    /// entries exceed theirs. A degraded transport halves both global limits.
    pub fn admit(
        &self,
        pressure: &PressureReport,
        contact_id: &str,
        health: TransportHealth,
    ) -> Option<DeferReason> {
        let (active_budget, pending_budget) = match health {
            TransportHealth::Offline => return Some(DeferReason::TransportOffline),
            TransportHealth::Degraded => (
                (self.config.max_active_global / 2).max(1),
                (self.config.max_pending_global / 2).max(1),
            ),
            TransportHealth::Healthy => {
                (self.config.max_active_global, self.config.max_pending_global)
            }
        };

        if pressure.global.download_queued >= active_budget
            || pressure.global.pending() > pending_budget
        {
            return Some(DeferReason::GlobalPressure);
        }

        let contact = pressure.per_contact.get(contact_id).copied().unwrap_or_default();
        if contact.download_queued >= self.config.max_active_per_contact
            || contact.pending() > self.config.max_pending_per_contact
        {
            return Some(DeferReason::ContactPressure);
        }
        None
    }

    /// Checks admission and, if allowed, performs the atomic claim.
    ///
    /// Losing the claim race returns [`PqmsgError::ClaimLost`].
    pub fn try_claim(
        &self,
        inbox: &dyn PingInbox,
        ping_id: &str,
        health: TransportHealth,
        now_ms: u64,
    ) -> Result<ClaimDecision> {
        let entry = inbox
            .get(ping_id)?
            .ok_or_else(|| PqmsgError::ClaimLost(ping_id.to_string()))?;

        let pressure = inbox.pressure()?;
        if let Some(reason) = self.admit(&pressure, &entry.contact_id, health) {
            debug!(ping_id, contact_id = %entry.contact_id, ?reason, "Auto-download deferred");
            return Ok(ClaimDecision::Deferred(reason));
        }

        super::require_row(inbox.claim_for_download(ping_id, now_ms)?, ping_id)?;
        Ok(ClaimDecision::Claimed)
    }
}
