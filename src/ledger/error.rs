//! Error types for ledger and hold operations.

use thiserror::Error;

use crate::Credits;
use crate::model::{AccountId, HoldId, HoldState};

/// Errors surfaced by [`CreditLedger`](super::CreditLedger) and the hold
/// protocol built on top of it.
///
/// Business errors (`InsufficientFunds`, `AccountNotFound`) are recoverable
/// and user-visible. `HoldNotActive` marks an attempted second terminal
/// transition. `StoreUnavailable` is transient infrastructure failure and is
/// kept distinct so callers can retry with backoff instead of treating it as
/// a business rejection.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("account {0} already exists")]
    AccountExists(AccountId),

    #[error("insufficient credits for account {account}: available {available}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        available: Credits,
        requested: Credits,
    },

    #[error("hold {0} not found")]
    HoldNotFound(HoldId),

    #[error("hold {hold} is {state}, not active")]
    HoldNotActive { hold: HoldId, state: HoldState },

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("ledger store unavailable")]
    StoreUnavailable,
}

impl LedgerError {
    /// Whether the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StoreUnavailable)
    }
}
