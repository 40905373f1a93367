//! Stuck-claim watchdog.
//!
//! A claimant that crashes while holding a `DownloadQueued` claim would keep
//! the entry forever. The watchdog applies the normal failure decision to
//! every claim older than the stuck threshold and runs the cleanup windows.

use super::{CleanupReport, FailureOutcome, PingConfig, PingInbox, PingState};
use crate::clock::SharedClock;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stuck claims moved to `FailedTemp`
    pub failed_temp: usize,
    /// Stuck claims moved to `ManualRequired`
    pub manual_required: usize,
    /// Entries purged by the retention windows
    pub cleanup: CleanupReport,
}

impl SweepReport {
    /// Number of stuck claims released.
    pub fn reclaimed(&self) -> usize {
        self.failed_temp + self.manual_required
    }
}

/// Periodic reclaim and cleanup over a ping inbox.
pub struct Watchdog {
    inbox: Arc<dyn PingInbox>,
    config: PingConfig,
    clock: SharedClock,
}

impl Watchdog {
    pub fn new(inbox: Arc<dyn PingInbox>, config: PingConfig, clock: SharedClock) -> Self {
        Self {
            inbox,
            config,
            clock,
        }
    }

    /// Runs one reclaim and cleanup pass.
    pub fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now_ms();
        let mut report = SweepReport::default();

        let stuck: Vec<String> = self
            .inbox
            .entries()?
            .into_iter()
            .filter(|entry| entry.is_stuck(self.config.stuck_claim_threshold_ms, now))
            .map(|entry| entry.ping_id)
            .collect();

        for ping_id in stuck {
            // The claimant may have finished between the scan and now; the
            // conditional update re-checks under the lock.
            match self.inbox.reclaim_if_stuck(&ping_id, &self.config, now)? {
                FailureOutcome::FailedTemp { attempt_count } => {
                    report.failed_temp += 1;
                    info!(ping_id = %ping_id, attempt_count, "Reclaimed stuck download");
                }
                FailureOutcome::ManualRequired { attempt_count } => {
                    report.manual_required += 1;
                    warn!(
                        ping_id = %ping_id,
                        attempt_count,
                        state = %PingState::ManualRequired,
                        "Stuck download exhausted retries"
                    );
                }
                FailureOutcome::NotApplied => {
                    debug!(ping_id = %ping_id, "Stuck claim resolved before reclaim");
                }
            }
        }

        report.cleanup = self.inbox.cleanup(&self.config, now)?;
        Ok(report)
    }

    /// Sweeps every `watchdog_interval_ms` until `shutdown` turns true or its
    /// sender is dropped. A sweep in progress always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.watchdog_interval_ms);
        info!(interval_ms = self.config.watchdog_interval_ms, "Watchdog started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.sweep() {
                Ok(report) if report.reclaimed() > 0 || report.cleanup.total() > 0 => {
                    info!(
                        reclaimed = report.reclaimed(),
                        purged = report.cleanup.total(),
                        "Watchdog sweep"
                    );
                }
                Ok(_) => debug!("Watchdog sweep found nothing"),
                Err(e) => error!(error = %e, "Watchdog sweep failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Watchdog stopped");
    }
}
