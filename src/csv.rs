//! CSV workload replay: input rows for the engine binary and the final
//! account report it prints.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Credits;
use crate::model::AccountId;

/// Errors that can occur when parsing workload rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized entry type '{entry}'")]
    UnrecognizedType { line: usize, entry: String },

    #[error("line {line}: {entry} missing {field}")]
    MissingField {
        line: usize,
        entry: &'static str,
        field: &'static str,
    },

    #[error("line {line}: unrecognized outcome '{outcome}' (expected 'ok' or 'err')")]
    UnrecognizedOutcome { line: usize, outcome: String },
}

/// One replayable workload entry.
#[derive(Debug, Clone)]
pub enum WorkloadEntry {
    /// Provision an account with an opening balance.
    Open {
        account: AccountId,
        class: String,
        balance: Credits,
    },
    /// Run a guarded operation with a simulated outcome.
    Run {
        account: AccountId,
        operation: String,
        cost: Credits,
        succeed: bool,
    },
    /// Place a hold and walk away, as a crashed request would.
    Abandon { account: AccountId, amount: Credits },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    account: AccountId,
    class: Option<String>,
    operation: Option<String>,
    amount: Option<u64>,
    outcome: Option<String>,
}

/// Read workload entries from a csv file
pub fn read_workload(
    path: impl AsRef<Path>,
) -> impl Iterator<Item = Result<WorkloadEntry, CsvError>> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .expect("failed to open csv file");

    reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            match row.r#type.as_str() {
                "open" => {
                    let balance = row.amount.ok_or(CsvError::MissingField {
                        line,
                        entry: "open",
                        field: "amount",
                    })?;
                    Ok(WorkloadEntry::Open {
                        account: row.account,
                        class: row
                            .class
                            .filter(|c| !c.is_empty())
                            .unwrap_or_else(|| "standard".to_string()),
                        balance: Credits::new(balance),
                    })
                }
                "run" => {
                    let operation = row
                        .operation
                        .filter(|o| !o.is_empty())
                        .ok_or(CsvError::MissingField {
                            line,
                            entry: "run",
                            field: "operation",
                        })?;
                    let cost = row.amount.ok_or(CsvError::MissingField {
                        line,
                        entry: "run",
                        field: "amount",
                    })?;
                    let succeed = match row.outcome.as_deref().filter(|o| !o.is_empty()) {
                        Some("ok") | None => true,
                        Some("err") => false,
                        Some(other) => {
                            return Err(CsvError::UnrecognizedOutcome {
                                line,
                                outcome: other.to_string(),
                            });
                        }
                    };
                    Ok(WorkloadEntry::Run {
                        account: row.account,
                        operation,
                        cost: Credits::new(cost),
                        succeed,
                    })
                }
                "abandon" => {
                    let amount = row.amount.ok_or(CsvError::MissingField {
                        line,
                        entry: "abandon",
                        field: "amount",
                    })?;
                    Ok(WorkloadEntry::Abandon {
                        account: row.account,
                        amount: Credits::new(amount),
                    })
                }
                other => Err(CsvError::UnrecognizedType {
                    line,
                    entry: other.to_string(),
                }),
            }
        })
}

#[derive(Debug, Serialize)]
struct OutputRow {
    account: AccountId,
    balance: String,
    reserved: String,
    available: String,
}

/// write final account state to stdout in csv format
pub fn write_accounts(
    accounts: impl IntoIterator<Item = (AccountId, Credits, Credits, Credits)>,
) {
    let stdout = io::stdout();
    let mut writer = csv::Writer::from_writer(stdout.lock());

    for (account, balance, reserved, available) in accounts {
        let row = OutputRow {
            account,
            balance: balance.to_string(),
            reserved: reserved.to_string(),
            available: available.to_string(),
        };
        writer.serialize(&row).expect("failed to write csv row");
    }

    writer.flush().expect("failed to flush csv writer");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const HEADER: &str = "type,account,class,operation,amount,outcome\n";

    #[test]
    fn read_open_defaults_class() {
        let file = write_csv(&format!("{HEADER}open,1,,,100,\n"));
        let results: Vec<_> = read_workload(file.path()).collect();
        assert_eq!(results.len(), 1);

        match results.into_iter().next().unwrap().unwrap() {
            WorkloadEntry::Open {
                account,
                class,
                balance,
            } => {
                assert_eq!(account, 1);
                assert_eq!(class, "standard");
                assert_eq!(balance, Credits::new(100));
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn read_open_with_class() {
        let file = write_csv(&format!("{HEADER}open,2,premium,,50,\n"));
        match read_workload(file.path()).next().unwrap().unwrap() {
            WorkloadEntry::Open { class, .. } => assert_eq!(class, "premium"),
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn read_run_with_outcomes() {
        let file = write_csv(&format!(
            "{HEADER}run,1,,export,30,ok\nrun,1,,export,30,err\nrun,1,,export,30,\n"
        ));
        let entries: Vec<_> = read_workload(file.path())
            .map(|r| r.unwrap())
            .collect();

        let succeeds: Vec<bool> = entries
            .iter()
            .map(|e| match e {
                WorkloadEntry::Run { succeed, .. } => *succeed,
                other => panic!("expected run, got {other:?}"),
            })
            .collect();
        assert_eq!(succeeds, vec![true, false, true]);
    }

    #[test]
    fn read_abandon() {
        let file = write_csv(&format!("{HEADER}abandon,1,,,40,\n"));
        match read_workload(file.path()).next().unwrap().unwrap() {
            WorkloadEntry::Abandon { account, amount } => {
                assert_eq!(account, 1);
                assert_eq!(amount, Credits::new(40));
            }
            other => panic!("expected abandon, got {other:?}"),
        }
    }

    #[test]
    fn read_with_whitespace() {
        let file = write_csv("type, account, class, operation, amount, outcome\nrun, 1, , export, 30, ok\n");
        let results: Vec<_> = read_workload(file.path()).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn read_returns_error_for_unknown_type() {
        let file = write_csv(&format!("{HEADER}bogus,1,,,10,\n"));
        let results: Vec<_> = read_workload(file.path()).collect();
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::UnrecognizedType { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_amount() {
        let file = write_csv(&format!("{HEADER}run,1,,export,,ok\n"));
        let results: Vec<_> = read_workload(file.path()).collect();
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(
            err,
            CsvError::MissingField {
                line: 2,
                field: "amount",
                ..
            }
        ));
    }

    #[test]
    fn read_returns_error_for_bad_outcome() {
        let file = write_csv(&format!("{HEADER}run,1,,export,30,maybe\n"));
        let results: Vec<_> = read_workload(file.path()).collect();
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::UnrecognizedOutcome { line: 2, .. }));
    }
}
