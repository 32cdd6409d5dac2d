//! Guarded execution: the hold → execute → commit/release contract.
//!
//! The executor is the single entry point calling code uses to run a costly
//! operation against an account's credits. Callers are charged only for
//! work that completed; a failed or cancelled operation releases its
//! reservation. Retried operations should therefore be idempotent.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info};

use crate::Credits;
use crate::anomaly::AnomalyDetector;
use crate::holds::HoldManager;
use crate::ledger::LedgerError;
use crate::metrics::MetricsRecorder;
use crate::model::{AccountId, HoldId, MetricSample, Outcome, now_ms};

/// Error returned by [`MeteredExecutor::run`].
#[derive(Debug, Error)]
pub enum ExecError<E> {
    /// The invocation was rejected before the operation ran: no charge, no
    /// execution. Carries `InsufficientFunds`, `AccountNotFound`, or a
    /// retryable store failure.
    #[error("operation rejected: {0}")]
    Rejected(#[from] LedgerError),

    /// The operation itself failed. The hold was released; the account was
    /// not charged.
    #[error(transparent)]
    Operation(E),
}

impl<E> ExecError<E> {
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            ExecError::Rejected(LedgerError::InsufficientFunds { .. })
        )
    }
}

/// Wraps arbitrary operations with credit gating, latency tracking, and
/// anomaly instrumentation.
#[derive(Debug)]
pub struct MeteredExecutor {
    holds: Arc<HoldManager>,
    metrics: Arc<MetricsRecorder>,
    detector: Arc<AnomalyDetector>,
    hold_ttl: Duration,
}

impl MeteredExecutor {
    pub fn new(
        holds: Arc<HoldManager>,
        metrics: Arc<MetricsRecorder>,
        detector: Arc<AnomalyDetector>,
        hold_ttl: Duration,
    ) -> Self {
        Self {
            holds,
            metrics,
            detector,
            hold_ttl,
        }
    }

    /// Run `operation` against `account`, charging `cost` credits on
    /// success.
    ///
    /// Places a hold for `cost`; if placement fails the operation is never
    /// invoked. On success the hold is committed and a Success sample
    /// recorded; on failure the hold is released (no charge for failed
    /// work) and the error propagated. The hold's terminal transition is
    /// guaranteed by a drop guard, so it happens even if the returned
    /// future is cancelled mid-operation.
    ///
    /// Cost is fixed at placement time: rate changes apply to future
    /// invocations, never retroactively to an outstanding hold.
    pub async fn run<T, E, F, Fut>(
        &self,
        account: AccountId,
        operation: &str,
        cost: Credits,
        f: F,
    ) -> Result<T, ExecError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let hold = match self.holds.place(account, cost, self.hold_ttl, now_ms()) {
            Ok(hold) => hold,
            Err(err) => {
                self.metrics.record_rejected(operation);
                info!(account, operation, cost = %cost, reason = %err, "invocation rejected");
                return Err(ExecError::Rejected(err));
            }
        };

        let mut guard = HoldGuard::new(&self.holds, hold.id);
        let started = Instant::now();
        let result = f().await;
        let latency = started.elapsed();

        let outcome = match &result {
            Ok(_) => {
                guard.commit();
                Outcome::Success
            }
            Err(_) => {
                guard.release();
                Outcome::Failure
            }
        };

        let sample = MetricSample {
            operation: operation.to_string(),
            outcome,
            latency,
            at: now_ms(),
        };
        self.metrics.record(&sample);
        self.detector.ingest(&sample);

        result.map_err(ExecError::Operation)
    }
}

/// Guarantees the hold's terminal transition on every exit path.
///
/// While armed, dropping the guard releases the hold; this is what frees
/// the reservation when the operation future is dropped by a timeout or
/// cancellation. `commit`/`release` disarm it first so the transition
/// happens exactly once.
struct HoldGuard<'a> {
    holds: &'a HoldManager,
    id: HoldId,
    armed: bool,
}

impl<'a> HoldGuard<'a> {
    fn new(holds: &'a HoldManager, id: HoldId) -> Self {
        Self {
            holds,
            id,
            armed: true,
        }
    }

    /// Commit the hold. The operation already succeeded, so settlement
    /// failures are logged for reconciliation instead of failing the call:
    /// an already-settled hold is a defect but financially resolved, and a
    /// store failure leaves the hold to the sweeper.
    fn commit(&mut self) {
        self.armed = false;
        match self.holds.commit(self.id, now_ms()) {
            Ok(_) => {}
            Err(err @ LedgerError::HoldNotActive { .. }) => {
                error!(hold = self.id, %err, "commit hit an already-settled hold");
            }
            Err(err) => {
                error!(
                    hold = self.id,
                    transition = "commit",
                    %err,
                    "post-execution settlement failed"
                );
            }
        }
    }

    fn release(&mut self) {
        self.armed = false;
        if let Err(err) = self.holds.release(self.id) {
            error!(
                hold = self.id,
                transition = "release",
                %err,
                "post-execution settlement failed"
            );
        }
    }
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.holds.release(self.id) {
            error!(
                hold = self.id,
                transition = "release",
                %err,
                "hold cleanup failed"
            );
        }
    }
}
