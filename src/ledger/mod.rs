//! Credit ledger: single source of truth for balances and the audit trail.
//!
//! All ledger data lives in one [`LedgerState`] guarded by a single mutex,
//! which is the transactional boundary: a balance mutation and its audit
//! record land in the same critical section or not at all. Operations on one
//! account are linearizable because every mutation takes the same lock.

use std::sync::Mutex;

use crate::Credits;
use crate::model::{
    AccountId, CreditAccount, CreditHold, CreditTransaction, HoldId, TimestampMs, TransactionKind,
};

mod error;
mod state;

pub use error::LedgerError;
pub(crate) use state::LedgerState;

/// Which kind of balance increase a [`CreditLedger::refund`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundKind {
    /// Credits returned to the account holder.
    Refund,
    /// Provisioning grant or manual correction.
    Adjustment,
}

impl RefundKind {
    fn as_transaction_kind(self) -> TransactionKind {
        match self {
            RefundKind::Refund => TransactionKind::Refund,
            RefundKind::Adjustment => TransactionKind::Adjustment,
        }
    }
}

/// Owns account balances, holds, and transaction history.
///
/// Shared across request handlers and the sweeper via `Arc`; all methods
/// take `&self`. A poisoned lock surfaces as
/// [`LedgerError::StoreUnavailable`] rather than a panic, mirroring a store
/// outage: callers back off and retry, and reconciliation stays possible.
#[derive(Debug, Default)]
pub struct CreditLedger {
    state: Mutex<LedgerState>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` inside the ledger's transactional critical section.
    ///
    /// The hold protocol composes on this: check-and-reserve and
    /// deduct-and-settle must each be one atomic unit.
    pub(crate) fn transact<T>(
        &self,
        f: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut state = self.state.lock().map_err(|_| LedgerError::StoreUnavailable)?;
        f(&mut state)
    }

    /// Provision an account with an opening balance.
    ///
    /// A non-zero opening balance is recorded as an Adjustment transaction,
    /// so conservation holds from the first entry of the audit trail.
    pub fn open_account(
        &self,
        id: AccountId,
        class: impl Into<String>,
        initial: Credits,
        now: TimestampMs,
    ) -> Result<(), LedgerError> {
        let class = class.into();
        self.transact(|state| {
            state.insert_account(id, class, now)?;
            if !initial.is_zero() {
                state.credit(id, initial, TransactionKind::Adjustment, now)?;
            }
            Ok(())
        })
    }

    /// Whether `available = balance − Σ active holds` covers `amount`.
    ///
    /// A consistent snapshot, but advisory only: `deduct` re-checks at
    /// commit time.
    pub fn verify(&self, account: AccountId, amount: Credits) -> Result<bool, LedgerError> {
        self.transact(|state| Ok(state.available(account)? >= amount))
    }

    /// Atomically decrease the balance and append the Deduct record.
    ///
    /// Fails with `InsufficientFunds` if the balance no longer covers
    /// `amount`, regardless of what `verify` said earlier.
    pub fn deduct(
        &self,
        account: AccountId,
        amount: Credits,
        hold: Option<HoldId>,
        now: TimestampMs,
    ) -> Result<CreditTransaction, LedgerError> {
        self.transact(|state| state.deduct(account, amount, hold, now))
    }

    /// Atomically increase the balance and append the Refund/Adjustment
    /// record. Fails only on an unknown account (or a zero amount).
    pub fn refund(
        &self,
        account: AccountId,
        amount: Credits,
        kind: RefundKind,
        now: TimestampMs,
    ) -> Result<CreditTransaction, LedgerError> {
        self.transact(|state| state.credit(account, amount, kind.as_transaction_kind(), now))
    }

    /// Snapshot of one account.
    pub fn account(&self, id: AccountId) -> Result<CreditAccount, LedgerError> {
        self.transact(|state| state.account(id).cloned())
    }

    /// Availability snapshot for one account.
    pub fn available(&self, id: AccountId) -> Result<Credits, LedgerError> {
        self.transact(|state| state.available(id))
    }

    /// Snapshot of one hold.
    pub fn hold(&self, id: HoldId) -> Result<CreditHold, LedgerError> {
        self.transact(|state| state.hold(id).cloned())
    }

    /// Audit trail for one account, in append order.
    pub fn transactions(&self, account: AccountId) -> Result<Vec<CreditTransaction>, LedgerError> {
        self.transact(|state| Ok(state.transactions_for(account).cloned().collect()))
    }

    /// Snapshot of all accounts, unordered.
    pub fn accounts(&self) -> Result<Vec<CreditAccount>, LedgerError> {
        self.transact(|state| Ok(state.accounts().cloned().collect()))
    }

    /// Active holds whose expiry deadline has passed.
    pub fn expired_active_holds(&self, now: TimestampMs) -> Result<Vec<HoldId>, LedgerError> {
        self.transact(|state| Ok(state.expired_active_holds(now)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::HoldState;

    fn ledger_with(account: AccountId, balance: u64) -> CreditLedger {
        let ledger = CreditLedger::new();
        ledger
            .open_account(account, "standard", Credits::new(balance), 0)
            .unwrap();
        ledger
    }

    #[test]
    fn open_account_records_opening_grant() {
        let ledger = ledger_with(1, 100);

        let account = ledger.account(1).unwrap();
        assert_eq!(account.balance, Credits::new(100));
        assert_eq!(account.class, "standard");

        let txs = ledger.transactions(1).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::Adjustment);
        assert_eq!(txs[0].amount, Credits::new(100));
    }

    #[test]
    fn open_account_zero_balance_records_nothing() {
        let ledger = CreditLedger::new();
        ledger.open_account(1, "trial", Credits::ZERO, 0).unwrap();
        assert!(ledger.transactions(1).unwrap().is_empty());
    }

    #[test]
    fn open_duplicate_account_fails() {
        let ledger = ledger_with(1, 100);
        let err = ledger
            .open_account(1, "standard", Credits::new(5), 0)
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountExists(1)));
    }

    #[test]
    fn verify_accounts_for_active_holds() {
        let ledger = ledger_with(1, 100);
        assert!(ledger.verify(1, Credits::new(100)).unwrap());

        ledger
            .transact(|s| s.insert_hold(1, Credits::new(40), Duration::from_secs(60), 0))
            .unwrap();

        assert!(ledger.verify(1, Credits::new(60)).unwrap());
        assert!(!ledger.verify(1, Credits::new(61)).unwrap());
    }

    #[test]
    fn verify_unknown_account_fails() {
        let ledger = CreditLedger::new();
        let err = ledger.verify(9, Credits::new(1)).unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(9)));
    }

    #[test]
    fn deduct_pairs_balance_change_with_record() {
        let ledger = ledger_with(1, 100);
        let tx = ledger.deduct(1, Credits::new(30), Some(7), 5).unwrap();

        assert_eq!(tx.kind, TransactionKind::Deduct);
        assert_eq!(tx.hold, Some(7));
        assert_eq!(ledger.account(1).unwrap().balance, Credits::new(70));
        assert_eq!(ledger.transactions(1).unwrap().len(), 2);
    }

    #[test]
    fn deduct_insufficient_balance_changes_nothing() {
        let ledger = ledger_with(1, 20);
        let err = ledger.deduct(1, Credits::new(30), None, 0).unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(ledger.account(1).unwrap().balance, Credits::new(20));
        assert_eq!(ledger.transactions(1).unwrap().len(), 1);
    }

    #[test]
    fn refund_increases_balance() {
        let ledger = ledger_with(1, 50);
        ledger
            .refund(1, Credits::new(25), RefundKind::Refund, 1)
            .unwrap();

        assert_eq!(ledger.account(1).unwrap().balance, Credits::new(75));
        let txs = ledger.transactions(1).unwrap();
        assert_eq!(txs.last().unwrap().kind, TransactionKind::Refund);
    }

    #[test]
    fn refund_unknown_account_fails() {
        let ledger = CreditLedger::new();
        let err = ledger
            .refund(3, Credits::new(10), RefundKind::Adjustment, 0)
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(3)));
    }

    #[test]
    fn conservation_over_mixed_operations() {
        let ledger = ledger_with(1, 100);
        ledger.deduct(1, Credits::new(30), None, 1).unwrap();
        ledger
            .refund(1, Credits::new(10), RefundKind::Refund, 2)
            .unwrap();
        ledger.deduct(1, Credits::new(5), None, 3).unwrap();

        // 100 − 30 + 10 − 5
        assert_eq!(ledger.account(1).unwrap().balance, Credits::new(75));

        let txs = ledger.transactions(1).unwrap();
        let deducted: u64 = txs
            .iter()
            .filter(|t| t.kind == TransactionKind::Deduct)
            .map(|t| t.amount.get())
            .sum();
        let credited: u64 = txs
            .iter()
            .filter(|t| t.kind != TransactionKind::Deduct)
            .map(|t| t.amount.get())
            .sum();
        // credited includes the opening grant, so the log alone reproduces
        // the balance
        assert_eq!(credited - deducted, 75);
    }

    #[test]
    fn expired_hold_listing_reflects_state() {
        let ledger = ledger_with(1, 100);
        let hold = ledger
            .transact(|s| s.insert_hold(1, Credits::new(10), Duration::from_millis(50), 0))
            .unwrap();

        assert!(ledger.expired_active_holds(10).unwrap().is_empty());
        assert_eq!(ledger.expired_active_holds(100).unwrap(), vec![hold.id]);

        ledger
            .transact(|s| s.settle_hold(hold.id, HoldState::Expired))
            .unwrap();
        assert!(ledger.expired_active_holds(100).unwrap().is_empty());
    }

    #[test]
    fn accounts_snapshot_returns_all() {
        let ledger = ledger_with(1, 100);
        ledger
            .open_account(2, "premium", Credits::new(200), 0)
            .unwrap();

        let mut accounts = ledger.accounts().unwrap();
        accounts.sort_by_key(|a| a.id);
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[1].class, "premium");
    }
}
