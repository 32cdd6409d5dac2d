//! Core domain types for the credit engine.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::Credits;

/// Account identifier.
pub type AccountId = u64;

/// Hold identifier.
pub type HoldId = u64;

/// Ledger transaction identifier.
pub type TxId = u64;

/// Epoch milliseconds. Components compare and record time as data; only the
/// outermost layer (executor, binary) reads the real clock.
pub type TimestampMs = u64;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A credit account: the unit of balance ownership.
///
/// Mutated only through ledger operations. The `class` label groups accounts
/// for the active-holds metric gauge; it carries no billing semantics.
#[derive(Debug, Clone)]
pub struct CreditAccount {
    pub id: AccountId,
    pub class: String,
    pub balance: Credits,
    pub updated_at: TimestampMs,
}

/// Lifecycle of a credit hold.
///
/// `Active` is the only non-terminal state; a hold leaves it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldState {
    Active,
    Committed,
    Released,
    Expired,
}

impl HoldState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, HoldState::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HoldState::Active => "active",
            HoldState::Committed => "committed",
            HoldState::Released => "released",
            HoldState::Expired => "expired",
        }
    }
}

impl std::fmt::Display for HoldState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reservation of credit against future spend. Shrinks availability but
/// does not move the balance until committed.
#[derive(Debug, Clone)]
pub struct CreditHold {
    pub id: HoldId,
    pub account: AccountId,
    pub amount: Credits,
    pub created_at: TimestampMs,
    pub expires_at: TimestampMs,
    pub state: HoldState,
}

impl CreditHold {
    /// Whether the hold's expiry deadline has passed.
    pub fn is_expired(&self, now: TimestampMs) -> bool {
        self.expires_at < now
    }
}

/// Direction and reason of a balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Balance decrease from a committed hold.
    Deduct,
    /// Balance increase returning credits to the account.
    Refund,
    /// Balance increase from provisioning or manual correction.
    Adjustment,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Deduct => "deduct",
            TransactionKind::Refund => "refund",
            TransactionKind::Adjustment => "adjustment",
        }
    }
}

/// Immutable audit record of one balance mutation. Append-only.
#[derive(Debug, Clone)]
pub struct CreditTransaction {
    pub id: TxId,
    pub account: AccountId,
    pub amount: Credits,
    pub kind: TransactionKind,
    /// Set when the mutation settles a hold.
    pub hold: Option<HoldId>,
    pub created_at: TimestampMs,
}

/// Result of one guarded operation invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// One observation of a guarded operation. Ephemeral: aggregated into
/// counters and histograms, never persisted individually.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub operation: String,
    pub outcome: Outcome,
    pub latency: Duration,
    pub at: TimestampMs,
}

/// Why an anomaly fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyReason {
    ErrorRateExceeded,
    LatencyExceeded,
}

impl AnomalyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyReason::ErrorRateExceeded => "error_rate_exceeded",
            AnomalyReason::LatencyExceeded => "latency_exceeded",
        }
    }
}

/// A threshold breach over one operation's trailing window.
///
/// Operation-scoped, not per-account. Emitted to a sink; the core does not
/// store these.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyEvent {
    pub operation: String,
    pub reason: AnomalyReason,
    /// Error rate as a fraction, or p95 latency in seconds.
    pub observed: f64,
    pub threshold: f64,
    pub at: TimestampMs,
    pub window: Duration,
}
