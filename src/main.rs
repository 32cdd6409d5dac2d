use std::env;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use credits_eng::csv::{WorkloadEntry, read_workload, write_accounts};
use credits_eng::model::now_ms;
use credits_eng::{
    AnomalyDetector, CreditLedger, Credits, EngineConfig, ExpiredHoldSweeper, HoldManager, LogSink,
    MeteredExecutor, MetricsRecorder,
};

#[derive(Debug, Error)]
#[error("simulated operation failure")]
struct SimulatedFailure;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let path = env::args()
        .nth(1)
        .expect("usage: credits-eng <workload.csv>");

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let config = EngineConfig::default();
    let ledger = Arc::new(CreditLedger::new());
    let metrics = Arc::new(MetricsRecorder::new());
    let holds = Arc::new(HoldManager::new(Arc::clone(&ledger), Arc::clone(&metrics)));
    let detector = Arc::new(AnomalyDetector::new(
        config.anomaly.clone(),
        Arc::new(LogSink),
    ));
    let executor = MeteredExecutor::new(
        Arc::clone(&holds),
        Arc::clone(&metrics),
        detector,
        config.hold_ttl(),
    );
    let sweeper = Arc::new(ExpiredHoldSweeper::new(Arc::clone(&holds)));

    // Stand in for the external scheduler: sweep on the configured
    // interval for as long as the replay runs.
    {
        let sweeper = Arc::clone(&sweeper);
        let interval = config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let report = sweeper.sweep(now_ms());
                info!(%report, "scheduled sweep");
            }
        });
    }

    let (entry_sender, entry_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in read_workload(&path) {
            match result {
                Ok(entry) => {
                    entry_sender.send(entry).await.unwrap();
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let mut entries = ReceiverStream::new(entry_receiver);
    while let Some(entry) = entries.next().await {
        match entry {
            WorkloadEntry::Open {
                account,
                class,
                balance,
            } => {
                if let Err(err) = ledger.open_account(account, class, balance, now_ms()) {
                    warn!(account, %err, "failed to open account");
                }
            }
            WorkloadEntry::Run {
                account,
                operation,
                cost,
                succeed,
            } => {
                let result = executor
                    .run(account, &operation, cost, || async move {
                        if succeed { Ok(()) } else { Err(SimulatedFailure) }
                    })
                    .await;
                if let Err(err) = result {
                    info!(account, operation = %operation, %err, "run entry did not complete");
                }
            }
            WorkloadEntry::Abandon { account, amount } => {
                // zero ttl: the hold is already stale by the final sweep
                match holds.place(account, amount, Duration::ZERO, now_ms()) {
                    Ok(hold) => info!(hold = hold.id, account, "abandoned hold placed"),
                    Err(err) => warn!(account, %err, "failed to place abandoned hold"),
                }
            }
        }
    }

    // let zero-ttl holds cross their expiry millisecond, then reclaim them
    tokio::time::sleep(Duration::from_millis(2)).await;
    let report = sweeper.sweep(now_ms());
    if report.scanned > 0 {
        info!(%report, "final sweep");
    }

    let mut rows: Vec<_> = ledger
        .accounts()
        .expect("ledger store poisoned")
        .into_iter()
        .map(|account| {
            let available = ledger
                .available(account.id)
                .unwrap_or(Credits::ZERO);
            let reserved = account.balance.saturating_sub(available);
            (account.id, account.balance, reserved, available)
        })
        .collect();
    rows.sort_by_key(|(account, ..)| *account);
    write_accounts(rows);

    eprint!("{}", metrics.render_prometheus());
}
