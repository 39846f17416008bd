// Ledger transaction core
//
// Balanced double-entry posting with exactly-once semantics per idempotency
// key. A submission either commits the transaction row, all of its postings
// and one `transaction.created` outbox event together, or commits nothing.
//
// Idempotency is first-write-wins: a replayed key returns the committed
// transaction as-is and the replayed body is not compared with it. Two
// different bodies under one key are therefore not an error.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::db::{clamp_limit, decimal_from_sql, timestamp_from_sql, timestamp_to_sql};
use crate::entities::account::check_length;
use crate::entities::{AccountRegistry, Direction, NewTransaction, Posting, Transaction};
use crate::error::{is_constraint_violation, LedgerError, Result};
use crate::outbox::{Outbox, TRANSACTION_CREATED};

/// Fractional digits kept for posting amounts.
pub const AMOUNT_SCALE: u32 = 6;

pub const MIN_POSTINGS: usize = 2;

/// A posting whose account has been resolved and checked.
#[derive(Debug, Clone)]
struct ResolvedPosting {
    account_id: i64,
    account_name: String,
    direction: Direction,
    amount: Decimal,
}

/// A submission that passed every domain rule and is ready to commit.
#[derive(Debug, Clone)]
pub(crate) struct ValidatedTransaction {
    reference: String,
    description: Option<String>,
    asset: String,
    postings: Vec<ResolvedPosting>,
}

pub struct Ledger<'c> {
    conn: &'c Connection,
}

impl<'c> Ledger<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Ledger { conn }
    }

    /// Submit a transaction under an idempotency key.
    ///
    /// 1. A key that is already committed returns that transaction unchanged.
    /// 2. At least two postings, every amount positive with at most six
    ///    fractional digits, debits equal to credits exactly.
    /// 3. Every account exists and carries the transaction's asset.
    /// 4. Transaction, postings and outbox event commit atomically.
    /// 5. Losing a same-key race to another writer falls back to step 1.
    pub fn submit_transaction(
        &self,
        request: &NewTransaction,
        idempotency_key: &str,
    ) -> Result<Transaction> {
        check_length("idempotency key", idempotency_key, 1, 128)?;

        if let Some(existing) = self.find_by_idempotency_key(idempotency_key)? {
            info!(
                transaction_id = existing.id,
                idempotency_key, "idempotent replay, returning committed transaction"
            );
            return Ok(existing);
        }

        let validated = self.validate(request)?;
        self.commit_or_fetch(&validated, idempotency_key)
    }

    /// Most recent transactions first. `limit` is clamped to [1, 500].
    pub fn list_transactions(&self, limit: i64) -> Result<Vec<Transaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, reference, description, asset, idempotency_key, created_at
             FROM transactions
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let headers = stmt
            .query_map([clamp_limit(limit)], transaction_header)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        self.with_postings(headers)
    }

    pub fn get_transaction(&self, id: i64) -> Result<Transaction> {
        let header = self
            .conn
            .query_row(
                "SELECT id, reference, description, asset, idempotency_key, created_at
                 FROM transactions WHERE id = ?1",
                [id],
                transaction_header,
            )
            .optional()?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", id)))?;

        self.with_postings(vec![header])?
            .pop()
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", id)))
    }

    pub fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Option<Transaction>> {
        let header = self
            .conn
            .query_row(
                "SELECT id, reference, description, asset, idempotency_key, created_at
                 FROM transactions WHERE idempotency_key = ?1",
                [idempotency_key],
                transaction_header,
            )
            .optional()?;

        match header {
            Some(header) => Ok(self.with_postings(vec![header])?.pop()),
            None => Ok(None),
        }
    }

    /// Every transaction in `asset`, oldest first, postings resolved.
    pub fn transactions_for_asset(&self, asset: &str) -> Result<Vec<Transaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, reference, description, asset, idempotency_key, created_at
             FROM transactions
             WHERE asset = ?1
             ORDER BY id ASC",
        )?;

        let headers = stmt
            .query_map([asset], transaction_header)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        self.with_postings(headers)
    }

    // ========================================================================
    // VALIDATION (no writes)
    // ========================================================================

    pub(crate) fn validate(&self, request: &NewTransaction) -> Result<ValidatedTransaction> {
        check_length("reference", &request.reference, 1, 64)?;
        if let Some(description) = &request.description {
            check_length("description", description, 0, 256)?;
        }
        check_length("asset", &request.asset, 1, 16)?;

        if request.postings.len() < MIN_POSTINGS {
            return Err(LedgerError::InvalidInput(format!(
                "a transaction needs at least {} postings, got {}",
                MIN_POSTINGS,
                request.postings.len()
            )));
        }

        for line in &request.postings {
            check_amount(line.amount)?;
        }

        let (Some(debits_total), Some(credits_total)) =
            (request.debits_total(), request.credits_total())
        else {
            return Err(LedgerError::InvalidAmount(
                "posting amounts overflow when summed".to_string(),
            ));
        };
        if debits_total != credits_total {
            return Err(LedgerError::UnbalancedTransaction {
                debits_total,
                credits_total,
            });
        }

        let registry = AccountRegistry::new(self.conn);
        let mut postings = Vec::with_capacity(request.postings.len());

        for line in &request.postings {
            let account = match registry.get_account_by_name(&line.account_name) {
                Ok(account) => account,
                Err(LedgerError::NotFound(_)) => {
                    return Err(LedgerError::UnknownAccount(line.account_name.clone()));
                }
                Err(e) => return Err(e),
            };

            if account.asset != request.asset {
                return Err(LedgerError::AssetMismatch {
                    account: account.name,
                    account_asset: account.asset,
                    tx_asset: request.asset.clone(),
                });
            }

            postings.push(ResolvedPosting {
                account_id: account.id,
                account_name: account.name,
                direction: line.direction,
                amount: line.amount,
            });
        }

        Ok(ValidatedTransaction {
            reference: request.reference.clone(),
            description: request.description.clone(),
            asset: request.asset.clone(),
            postings,
        })
    }

    // ========================================================================
    // COMMIT
    // ========================================================================

    /// Commit, or return the winner's transaction if the key was taken
    /// between the idempotency check and the insert.
    pub(crate) fn commit_or_fetch(
        &self,
        validated: &ValidatedTransaction,
        idempotency_key: &str,
    ) -> Result<Transaction> {
        match self.commit(validated, idempotency_key) {
            Err(LedgerError::StorageConflict(_)) => {
                warn!(idempotency_key, "lost idempotency race, reading committed transaction");
                self.find_by_idempotency_key(idempotency_key)?.ok_or_else(|| {
                    LedgerError::NotFound(format!("transaction for key '{}'", idempotency_key))
                })
            }
            other => other,
        }
    }

    fn commit(&self, validated: &ValidatedTransaction, idempotency_key: &str) -> Result<Transaction> {
        // IMMEDIATE takes the write lock up front so concurrent writers queue
        // on the busy timeout instead of failing on lock upgrade.
        let tx = rusqlite::Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let created_at = Utc::now();

        let inserted = tx.execute(
            "INSERT INTO transactions (reference, description, asset, idempotency_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                validated.reference,
                validated.description,
                validated.asset,
                idempotency_key,
                timestamp_to_sql(&created_at),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                // dropping `tx` rolls back
                return Err(LedgerError::StorageConflict(idempotency_key.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let transaction_id = tx.last_insert_rowid();

        let mut postings = Vec::with_capacity(validated.postings.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO postings (transaction_id, account_id, direction, amount)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;

            for line in &validated.postings {
                stmt.execute(params![
                    transaction_id,
                    line.account_id,
                    line.direction.as_str(),
                    line.amount.to_string(),
                ])?;

                postings.push(Posting {
                    id: tx.last_insert_rowid(),
                    account_id: line.account_id,
                    account_name: line.account_name.clone(),
                    direction: line.direction,
                    amount: line.amount,
                });
            }
        }

        Outbox::append(
            &tx,
            TRANSACTION_CREATED,
            &serde_json::json!({
                "transaction_id": transaction_id,
                "reference": validated.reference,
                "asset": validated.asset,
            }),
        )?;

        tx.commit()?;

        info!(
            transaction_id,
            reference = %validated.reference,
            asset = %validated.asset,
            postings = postings.len(),
            "transaction committed"
        );

        Ok(Transaction {
            id: transaction_id,
            reference: validated.reference.clone(),
            description: validated.description.clone(),
            asset: validated.asset.clone(),
            idempotency_key: idempotency_key.to_string(),
            created_at,
            postings,
        })
    }

    // ========================================================================
    // READ HELPERS
    // ========================================================================

    fn with_postings(&self, headers: Vec<Transaction>) -> Result<Vec<Transaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id, p.account_id, a.name, p.direction, p.amount
             FROM postings p
             JOIN accounts a ON a.id = p.account_id
             WHERE p.transaction_id = ?1
             ORDER BY p.id ASC",
        )?;

        let mut transactions = Vec::with_capacity(headers.len());
        for mut header in headers {
            header.postings = stmt
                .query_map([header.id], posting_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            transactions.push(header);
        }

        Ok(transactions)
    }
}

fn check_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(LedgerError::InvalidAmount(format!(
            "amount {} has more than {} fractional digits",
            amount, AMOUNT_SCALE
        )));
    }
    Ok(())
}

/// Transaction row without postings.
fn transaction_header(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let created_at: String = row.get(5)?;

    Ok(Transaction {
        id: row.get(0)?,
        reference: row.get(1)?,
        description: row.get(2)?,
        asset: row.get(3)?,
        idempotency_key: row.get(4)?,
        created_at: timestamp_from_sql(5, &created_at)?,
        postings: Vec::new(),
    })
}

fn posting_row(row: &Row<'_>) -> rusqlite::Result<Posting> {
    let direction: String = row.get(3)?;
    let amount: String = row.get(4)?;

    Ok(Posting {
        id: row.get(0)?,
        account_id: row.get(1)?,
        account_name: row.get(2)?,
        direction: direction.parse().map_err(|e: LedgerError| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
            )
        })?,
        amount: decimal_from_sql(4, &amount)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================
