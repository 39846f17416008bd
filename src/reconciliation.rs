// Reconciliation Engine - internal cash movements vs. the bank feed
//
// Matching is a multiset comparison of amounts rounded to cents:
//
//   matched           = Σ_amount min(count_internal, count_bank)
//   missing_in_bank   = Σ_amount max(0, count_internal - count_bank)
//   missing_in_ledger = Σ_amount max(0, count_bank - count_internal)
//
// Dates and references do not take part, and two different true pairs that
// share an amount are indistinguishable. Entry-level pairing needs a richer
// matcher.
//
// Every run is recorded. The RUNNING row is committed before any matching
// starts and is finalized exactly once, to SUCCEEDED or FAILED.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::bank_feed::BankFeedSource;
use crate::config::ReconciliationSettings;
use crate::db::{clamp_limit, timestamp_from_sql, timestamp_to_sql};
use crate::entities::Transaction;
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;

/// Amounts are compared at this many fractional digits.
pub const MATCH_SCALE: u32 = 2;

/// Nets at or below 1e-9 are treated as no movement.
pub const NET_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 9);

const STRATEGY_NOTE: &str =
    "Matching is amount-based: counts of equal amounts rounded to 2 decimals; dates and references are not compared.";

// ============================================================================
// RUN STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// RUNNING -> SUCCEEDED | FAILED. Nothing else.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(self, RunStatus::Running) && next.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCEEDED" => Ok(RunStatus::Succeeded),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(LedgerError::InvalidInput(format!("unknown run status '{}'", other))),
        }
    }
}

// ============================================================================
// SUMMARY & RUN RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub matched: u64,
    pub missing_in_bank: u64,
    pub missing_in_ledger: u64,
    /// Always 0: amount-only matching cannot tell a wrong amount from a
    /// missing entry.
    pub mismatched_amount: u64,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Summary on success, `{"error": ...}` on failure, None while running
    pub summary: Option<serde_json::Value>,
}

impl ReconciliationRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(1)?;
        let started_at: String = row.get(2)?;
        let finished_at: Option<String> = row.get(3)?;
        let summary: Option<String> = row.get(4)?;

        Ok(ReconciliationRun {
            id: row.get(0)?,
            status: status.parse().map_err(|e: LedgerError| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
                )
            })?,
            started_at: timestamp_from_sql(2, &started_at)?,
            finished_at: finished_at
                .map(|raw| timestamp_from_sql(3, &raw))
                .transpose()?,
            summary: summary
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
                })?,
        })
    }
}

// ============================================================================
// MATCHING (pure)
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchCounts {
    pub matched: u64,
    pub missing_in_bank: u64,
    pub missing_in_ledger: u64,
}

/// Round to cents (banker's rounding) and count occurrences per amount.
fn multiset(amounts: &[Decimal]) -> BTreeMap<Decimal, u64> {
    let mut buckets = BTreeMap::new();
    for amount in amounts {
        *buckets.entry(amount.round_dp(MATCH_SCALE)).or_insert(0) += 1;
    }
    buckets
}

/// Multiset comparison of internal and bank amounts.
pub fn match_movements(internal: &[Decimal], bank: &[Decimal]) -> MatchCounts {
    let internal = multiset(internal);
    let bank = multiset(bank);
    let mut counts = MatchCounts::default();

    for (amount, &count) in &internal {
        let paired = count.min(bank.get(amount).copied().unwrap_or(0));
        counts.matched += paired;
        counts.missing_in_bank += count - paired;
    }

    for (amount, &count) in &bank {
        let paired = count.min(internal.get(amount).copied().unwrap_or(0));
        counts.missing_in_ledger += count - paired;
    }

    counts
}

/// One net signed cash movement per transaction that touches a cash account.
///
/// DEBIT adds, CREDIT subtracts, summed over postings whose account name
/// contains `selector` (case-insensitive). Transactions that move money
/// between two cash accounts net to zero and are dropped.
pub fn internal_movements(transactions: &[Transaction], selector: &str) -> Vec<Decimal> {
    let selector = selector.to_lowercase();

    transactions
        .iter()
        .filter_map(|tx| {
            let mut touched = false;
            let net: Decimal = tx
                .postings
                .iter()
                .filter(|p| p.account_name.to_lowercase().contains(&selector))
                .inspect(|_| touched = true)
                .map(|p| p.direction.signed(p.amount))
                .sum();

            (touched && net.abs() > NET_EPSILON).then_some(net)
        })
        .collect()
}

// ============================================================================
// RUN STORE
// ============================================================================

/// Persistence of run records and their state machine.
pub struct RunStore<'c> {
    conn: &'c Connection,
}

impl<'c> RunStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        RunStore { conn }
    }

    /// Insert a RUNNING run. Committed immediately so a crash mid-run leaves
    /// a visible record.
    pub fn start(&self) -> Result<ReconciliationRun> {
        let started_at = Utc::now();
        self.conn.execute(
            "INSERT INTO reconciliation_runs (status, started_at) VALUES (?1, ?2)",
            params![RunStatus::Running.as_str(), timestamp_to_sql(&started_at)],
        )?;

        Ok(ReconciliationRun {
            id: self.conn.last_insert_rowid(),
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            summary: None,
        })
    }

    /// Move a RUNNING run to a terminal status. Happens once per run.
    pub fn finish(
        &self,
        id: i64,
        status: RunStatus,
        summary: &serde_json::Value,
    ) -> Result<ReconciliationRun> {
        if !RunStatus::Running.can_transition_to(status) {
            return Err(LedgerError::InvalidInput(format!(
                "cannot finish a run as {}",
                status
            )));
        }

        let finished_at = Utc::now();
        let updated = self.conn.execute(
            "UPDATE reconciliation_runs
             SET status = ?1, finished_at = ?2, summary = ?3
             WHERE id = ?4 AND status = 'RUNNING'",
            params![
                status.as_str(),
                timestamp_to_sql(&finished_at),
                serde_json::to_string(summary)?,
                id,
            ],
        )?;

        if updated == 0 {
            // Either no such run or it already reached a terminal state
            self.get_run(id)?;
            return Err(LedgerError::RunAlreadyFinalized(id));
        }

        self.get_run(id)
    }

    pub fn get_run(&self, id: i64) -> Result<ReconciliationRun> {
        self.conn
            .query_row(
                "SELECT id, status, started_at, finished_at, summary
                 FROM reconciliation_runs WHERE id = ?1",
                [id],
                ReconciliationRun::from_row,
            )
            .optional()?
            .ok_or_else(|| LedgerError::NotFound(format!("reconciliation run {}", id)))
    }

    /// Most recent runs first. `limit` is clamped to [1, 500].
    pub fn list_runs(&self, limit: i64) -> Result<Vec<ReconciliationRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, status, started_at, finished_at, summary
             FROM reconciliation_runs
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let runs = stmt
            .query_map([clamp_limit(limit)], ReconciliationRun::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(runs)
    }

    /// Fail every RUNNING run that started more than `max_age` ago.
    ///
    /// Runs whose process died mid-way would otherwise stay RUNNING forever.
    /// Returns how many runs were moved to FAILED.
    pub fn reap_stale_runs(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| LedgerError::InvalidInput(format!("stale run age: {}", e)))?;
        let cutoff = Utc::now() - max_age;

        let mut stmt = self.conn.prepare(
            "SELECT id, status, started_at, finished_at, summary
             FROM reconciliation_runs
             WHERE status = 'RUNNING'
             ORDER BY id ASC",
        )?;
        let stale: Vec<ReconciliationRun> = stmt
            .query_map([], ReconciliationRun::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|run| run.started_at < cutoff)
            .collect();

        let mut reaped = 0;
        for run in stale {
            let summary = serde_json::json!({
                "error": format!("abandoned: still RUNNING after {}s", max_age.num_seconds()),
            });
            match self.finish(run.id, RunStatus::Failed, &summary) {
                Ok(_) => reaped += 1,
                // finished by its owner in the meantime
                Err(LedgerError::RunAlreadyFinalized(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if reaped > 0 {
            warn!(reaped, "stale reconciliation runs marked FAILED");
        }

        Ok(reaped)
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine<'a> {
    settings: &'a ReconciliationSettings,
    feed: &'a dyn BankFeedSource,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(settings: &'a ReconciliationSettings, feed: &'a dyn BankFeedSource) -> Self {
        ReconciliationEngine { settings, feed }
    }

    /// Run one reconciliation and record it.
    ///
    /// The run record always ends SUCCEEDED or FAILED before this returns;
    /// on failure the error is still reported to the caller as
    /// `ReconciliationFailure`.
    pub fn run(&self, conn: &Connection) -> Result<ReconciliationSummary> {
        let store = RunStore::new(conn);
        let run = store.start()?;
        info!(run_id = run.id, asset = %self.settings.asset, "reconciliation started");

        let outcome = self.compute(conn).and_then(|summary| {
            store.finish(run.id, RunStatus::Succeeded, &serde_json::to_value(&summary)?)?;
            Ok(summary)
        });

        match outcome {
            Ok(summary) => {
                info!(
                    run_id = run.id,
                    matched = summary.matched,
                    missing_in_bank = summary.missing_in_bank,
                    missing_in_ledger = summary.missing_in_ledger,
                    "reconciliation succeeded"
                );
                Ok(summary)
            }
            Err(e) => {
                let message = e.to_string();
                error!(run_id = run.id, error = %message, "reconciliation failed");

                let failure = serde_json::json!({ "error": message });
                match store.finish(run.id, RunStatus::Failed, &failure) {
                    Ok(_) => Err(LedgerError::ReconciliationFailure(message)),
                    Err(finish_err) => {
                        error!(run_id = run.id, error = %finish_err, "could not record failed run");
                        Err(LedgerError::ReconciliationFailure(format!(
                            "{}; run {} could not be marked FAILED: {}",
                            message, run.id, finish_err
                        )))
                    }
                }
            }
        }
    }

    fn compute(&self, conn: &Connection) -> Result<ReconciliationSummary> {
        let transactions = Ledger::new(conn).transactions_for_asset(&self.settings.asset)?;
        let internal = internal_movements(&transactions, &self.settings.cash_account_selector);

        let bank: Vec<Decimal> = self
            .feed
            .movements(&self.settings.asset, self.settings.window_days)?
            .into_iter()
            .map(|m| m.amount)
            .collect();

        let counts = match_movements(&internal, &bank);

        Ok(ReconciliationSummary {
            matched: counts.matched,
            missing_in_bank: counts.missing_in_bank,
            missing_in_ledger: counts.missing_in_ledger,
            mismatched_amount: 0,
            notes: vec![
                STRATEGY_NOTE.to_string(),
                format!(
                    "internal_cash_movements={} bank_movements={}",
                    internal.len(),
                    bank.len()
                ),
            ],
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
