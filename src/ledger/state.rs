use std::collections::HashMap;
use std::time::Duration;

use crate::Credits;
use crate::model::{
    AccountId, CreditAccount, CreditHold, CreditTransaction, HoldId, HoldState, TimestampMs,
    TransactionKind, TxId,
};

use super::error::LedgerError;

/// The authoritative ledger state: accounts, holds, and the append-only
/// transaction log. Always accessed under the ledger mutex; every method
/// runs inside one critical section, so a balance mutation and its
/// transaction record are a single atomic unit.
#[derive(Debug, Default)]
pub(crate) struct LedgerState {
    accounts: HashMap<AccountId, CreditAccount>,
    holds: HashMap<HoldId, CreditHold>,
    transactions: Vec<CreditTransaction>,
    next_hold_id: HoldId,
    next_tx_id: TxId,
}

impl LedgerState {
    pub(crate) fn account(&self, id: AccountId) -> Result<&CreditAccount, LedgerError> {
        self.accounts.get(&id).ok_or(LedgerError::AccountNotFound(id))
    }

    fn account_mut(&mut self, id: AccountId) -> Result<&mut CreditAccount, LedgerError> {
        self.accounts
            .get_mut(&id)
            .ok_or(LedgerError::AccountNotFound(id))
    }

    pub(crate) fn insert_account(
        &mut self,
        id: AccountId,
        class: String,
        now: TimestampMs,
    ) -> Result<(), LedgerError> {
        if self.accounts.contains_key(&id) {
            return Err(LedgerError::AccountExists(id));
        }
        self.accounts.insert(
            id,
            CreditAccount {
                id,
                class,
                balance: Credits::ZERO,
                updated_at: now,
            },
        );
        Ok(())
    }

    /// Sum of amounts reserved by Active holds against `account`.
    pub(crate) fn active_hold_total(&self, account: AccountId) -> Credits {
        self.holds
            .values()
            .filter(|h| h.account == account && h.state == HoldState::Active)
            .map(|h| h.amount)
            .sum()
    }

    /// Availability: balance minus Active reservations.
    pub(crate) fn available(&self, account: AccountId) -> Result<Credits, LedgerError> {
        let balance = self.account(account)?.balance;
        Ok(balance.saturating_sub(self.active_hold_total(account)))
    }

    fn append_tx(
        &mut self,
        account: AccountId,
        amount: Credits,
        kind: TransactionKind,
        hold: Option<HoldId>,
        now: TimestampMs,
    ) -> CreditTransaction {
        self.next_tx_id += 1;
        let tx = CreditTransaction {
            id: self.next_tx_id,
            account,
            amount,
            kind,
            hold,
            created_at: now,
        };
        self.transactions.push(tx.clone());
        tx
    }

    /// Decrease the balance and append the paired Deduct record.
    ///
    /// The bound is re-checked here regardless of any earlier `verify`:
    /// commit-time state is the one that counts. A deduction settling a
    /// hold is bounded by the balance (its own reservation covers it); a
    /// direct deduction is bounded by availability, so it cannot eat into
    /// credits other holds have reserved.
    pub(crate) fn deduct(
        &mut self,
        account: AccountId,
        amount: Credits,
        hold: Option<HoldId>,
        now: TimestampMs,
    ) -> Result<CreditTransaction, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }
        let reserved = self.active_hold_total(account);
        let acct = self.account_mut(account)?;
        let spendable = if hold.is_some() {
            acct.balance
        } else {
            acct.balance.saturating_sub(reserved)
        };
        if spendable < amount {
            return Err(LedgerError::InsufficientFunds {
                account,
                available: spendable,
                requested: amount,
            });
        }
        acct.balance = acct.balance.saturating_sub(amount);
        acct.updated_at = now;
        Ok(self.append_tx(account, amount, TransactionKind::Deduct, hold, now))
    }

    /// Increase the balance and append the paired Refund/Adjustment record.
    pub(crate) fn credit(
        &mut self,
        account: AccountId,
        amount: Credits,
        kind: TransactionKind,
        now: TimestampMs,
    ) -> Result<CreditTransaction, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }
        let acct = self.account_mut(account)?;
        acct.balance = acct
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::StoreUnavailable)?;
        acct.updated_at = now;
        Ok(self.append_tx(account, amount, kind, None, now))
    }

    /// Reserve `amount` against `account` if availability allows it.
    /// Availability is checked and the hold inserted in the same critical
    /// section, so two concurrent placements cannot both fit into the same
    /// headroom.
    pub(crate) fn insert_hold(
        &mut self,
        account: AccountId,
        amount: Credits,
        ttl: Duration,
        now: TimestampMs,
    ) -> Result<CreditHold, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }
        let available = self.available(account)?;
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                account,
                available,
                requested: amount,
            });
        }
        self.next_hold_id += 1;
        let hold = CreditHold {
            id: self.next_hold_id,
            account,
            amount,
            created_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
            state: HoldState::Active,
        };
        self.holds.insert(hold.id, hold.clone());
        Ok(hold)
    }

    pub(crate) fn hold(&self, id: HoldId) -> Result<&CreditHold, LedgerError> {
        self.holds.get(&id).ok_or(LedgerError::HoldNotFound(id))
    }

    /// Move an Active hold into a terminal state. Callers validate the
    /// current state first; this enforces it again as the last line of
    /// defense for the exactly-one-terminal-transition invariant.
    pub(crate) fn settle_hold(
        &mut self,
        id: HoldId,
        to: HoldState,
    ) -> Result<(), LedgerError> {
        let hold = self.holds.get_mut(&id).ok_or(LedgerError::HoldNotFound(id))?;
        if hold.state != HoldState::Active {
            return Err(LedgerError::HoldNotActive {
                hold: id,
                state: hold.state,
            });
        }
        hold.state = to;
        Ok(())
    }

    /// Active holds whose expiry deadline has passed, for the sweep scan.
    pub(crate) fn expired_active_holds(&self, now: TimestampMs) -> Vec<HoldId> {
        let mut ids: Vec<HoldId> = self
            .holds
            .values()
            .filter(|h| h.state == HoldState::Active && h.is_expired(now))
            .map(|h| h.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn accounts(&self) -> impl Iterator<Item = &CreditAccount> {
        self.accounts.values()
    }

    pub(crate) fn transactions_for(
        &self,
        account: AccountId,
    ) -> impl Iterator<Item = &CreditTransaction> {
        self.transactions.iter().filter(move |t| t.account == account)
    }
}
