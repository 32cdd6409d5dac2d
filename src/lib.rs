pub mod anomaly;
pub mod config;
pub mod credits;
pub mod csv;
pub mod executor;
pub mod holds;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod sweeper;

pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalySink, ChannelSink, LogSink};
pub use config::EngineConfig;
pub use credits::Credits;
pub use executor::{ExecError, MeteredExecutor};
pub use holds::HoldManager;
pub use ledger::{CreditLedger, LedgerError, RefundKind};
pub use metrics::MetricsRecorder;
pub use model::{AccountId, AnomalyEvent, HoldId, HoldState, Outcome, TxId};
pub use sweeper::{ExpiredHoldSweeper, SweepReport};
