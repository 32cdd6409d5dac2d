//! Periodic reclamation of stale credit holds.
//!
//! Holds left Active by crashed or abandoned requests would otherwise
//! starve availability forever. The sweeper scans for Active holds past
//! their expiry and transitions each to Expired. Scheduling is external:
//! whoever owns the clock calls [`ExpiredHoldSweeper::sweep`] on the
//! configured interval.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::holds::HoldManager;
use crate::ledger::LedgerError;
use crate::model::{HoldId, TimestampMs};

/// One hold (or the scan itself, when `hold` is `None`) that a sweep pass
/// failed to process.
#[derive(Debug)]
pub struct SweepFailure {
    pub hold: Option<HoldId>,
    pub error: LedgerError,
}

/// Outcome of one sweep pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Stale Active holds the scan found.
    pub scanned: usize,
    /// Holds this pass transitioned to Expired.
    pub expired: usize,
    /// Failures encountered; the sweep continued past each of them.
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {} stale holds, expired {}, {} failures",
            self.scanned,
            self.expired,
            self.failures.len()
        )
    }
}

/// Reclaims expired holds so reservations cannot leak availability.
#[derive(Debug)]
pub struct ExpiredHoldSweeper {
    holds: Arc<HoldManager>,
}

impl ExpiredHoldSweeper {
    pub fn new(holds: Arc<HoldManager>) -> Self {
        Self { holds }
    }

    /// Run one sweep pass at time `now`.
    ///
    /// Holds are processed independently: one failure never aborts the
    /// rest of the pass. Safe to run concurrently with live traffic and
    /// with an overlapping sweep, because expiry is idempotent: a hold
    /// settled by somebody else in the meantime counts as already done,
    /// not as an error.
    pub fn sweep(&self, now: TimestampMs) -> SweepReport {
        let mut report = SweepReport::default();

        let candidates = match self.holds.expired_holds(now) {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!(%error, "sweep scan failed");
                report.failures.push(SweepFailure { hold: None, error });
                return report;
            }
        };
        report.scanned = candidates.len();

        for hold in candidates {
            match self.holds.expire(hold) {
                Ok(true) => report.expired += 1,
                // settled by a racing caller or sweep after the scan
                Ok(false) => {}
                Err(error) => {
                    warn!(hold, %error, "failed to expire hold");
                    report.failures.push(SweepFailure {
                        hold: Some(hold),
                        error,
                    });
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                failures = report.failures.len(),
                "sweep pass finished"
            );
        }
        report
    }
}
