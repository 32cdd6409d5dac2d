//! Reservation protocol bridging "intent to spend" and "confirmed spend".
//!
//! A hold shrinks availability without moving the balance; commit converts
//! it into a deduction, release and expire return the headroom. All three
//! terminal transitions happen inside the ledger's critical section, so a
//! hold settles exactly once no matter how callers and the sweeper race.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::Credits;
use crate::ledger::{CreditLedger, LedgerError};
use crate::metrics::MetricsRecorder;
use crate::model::{AccountId, CreditHold, CreditTransaction, HoldId, HoldState, TimestampMs};

/// Creates, commits, releases, and expires credit holds against the ledger.
/// Owns the active-holds gauge updates.
#[derive(Debug)]
pub struct HoldManager {
    ledger: Arc<CreditLedger>,
    metrics: Arc<MetricsRecorder>,
}

impl HoldManager {
    pub fn new(ledger: Arc<CreditLedger>, metrics: Arc<MetricsRecorder>) -> Self {
        Self { ledger, metrics }
    }

    /// Reserve `amount` against `account` until `now + ttl`.
    ///
    /// Fails with `InsufficientFunds` when availability (balance minus
    /// existing Active holds) does not cover the amount. No balance
    /// movement happens here.
    pub fn place(
        &self,
        account: AccountId,
        amount: Credits,
        ttl: Duration,
        now: TimestampMs,
    ) -> Result<CreditHold, LedgerError> {
        let (hold, class) = self.ledger.transact(|state| {
            let class = state.account(account)?.class.clone();
            let hold = state.insert_hold(account, amount, ttl, now)?;
            Ok((hold, class))
        })?;
        self.metrics.hold_placed(&class);
        info!(hold = hold.id, account, amount = %amount, "hold placed");
        Ok(hold)
    }

    /// Convert an Active hold into a permanent deduction.
    ///
    /// The deduction and the Committed transition are one atomic unit, and
    /// a hold can only leave Active once, so the financial effect is
    /// exactly-once. A hold past its expiry but not yet swept commits
    /// normally. Fails with `HoldNotActive` on any terminal state.
    pub fn commit(&self, hold: HoldId, now: TimestampMs) -> Result<CreditTransaction, LedgerError> {
        let (tx, class) = self.ledger.transact(|state| {
            let found = state.hold(hold)?;
            if found.state != HoldState::Active {
                return Err(LedgerError::HoldNotActive {
                    hold,
                    state: found.state,
                });
            }
            let (account, amount) = (found.account, found.amount);
            let class = state.account(account)?.class.clone();
            let tx = state.deduct(account, amount, Some(hold), now)?;
            state.settle_hold(hold, HoldState::Committed)?;
            Ok((tx, class))
        })?;
        self.metrics.hold_settled(&class);
        info!(hold, tx = tx.id, amount = %tx.amount, "hold committed");
        Ok(tx)
    }

    /// Return an Active hold's reservation without any ledger mutation.
    ///
    /// Idempotent: releasing an already-terminal hold is a no-op, because
    /// callers legitimately race the sweeper.
    pub fn release(&self, hold: HoldId) -> Result<(), LedgerError> {
        if self.settle(hold, HoldState::Released)? {
            info!(hold, "hold released");
        }
        Ok(())
    }

    /// Sweeper-only equivalent of [`release`](Self::release); transitions
    /// Active → Expired. Returns whether this call performed the
    /// transition.
    pub fn expire(&self, hold: HoldId) -> Result<bool, LedgerError> {
        let transitioned = self.settle(hold, HoldState::Expired)?;
        if transitioned {
            info!(hold, "hold expired");
        }
        Ok(transitioned)
    }

    /// Active holds whose expiry deadline passed, for the sweep scan.
    pub fn expired_holds(&self, now: TimestampMs) -> Result<Vec<HoldId>, LedgerError> {
        self.ledger.expired_active_holds(now)
    }

    fn settle(&self, hold: HoldId, to: HoldState) -> Result<bool, LedgerError> {
        let class = self.ledger.transact(|state| {
            let found = state.hold(hold)?;
            if found.state.is_terminal() {
                return Ok(None);
            }
            let class = state.account(found.account)?.class.clone();
            state.settle_hold(hold, to)?;
            Ok(Some(class))
        })?;
        match class {
            Some(class) => {
                self.metrics.hold_settled(&class);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
