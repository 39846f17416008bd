// Account entity and registry
//
// Accounts are created once and never updated or deleted. The name is the
// lookup key used by transaction submissions and is unique, case-sensitive.
// Postings refer to accounts by integer id only.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{timestamp_from_sql, timestamp_to_sql};
use crate::error::{is_constraint_violation, LedgerError, Result};

// ============================================================================
// ACCOUNT TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountType {
    Asset,
    Liability,
    Income,
    Expense,
    Equity,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "ASSET",
            AccountType::Liability => "LIABILITY",
            AccountType::Income => "INCOME",
            AccountType::Expense => "EXPENSE",
            AccountType::Equity => "EQUITY",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = LedgerError;

    /// Exact, upper-case match only.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ASSET" => Ok(AccountType::Asset),
            "LIABILITY" => Ok(AccountType::Liability),
            "INCOME" => Ok(AccountType::Income),
            "EXPENSE" => Ok(AccountType::Expense),
            "EQUITY" => Ok(AccountType::Equity),
            other => Err(LedgerError::InvalidInput(format!(
                "account type must be one of ASSET, LIABILITY, INCOME, EXPENSE, EQUITY; got '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// ACCOUNT ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    /// Currency or unit code, e.g. "USD"
    pub asset: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub created_at: DateTime<Utc>,
}

impl Account {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let account_type: String = row.get(3)?;
        let created_at: String = row.get(4)?;

        Ok(Account {
            id: row.get(0)?,
            name: row.get(1)?,
            asset: row.get(2)?,
            account_type: account_type.parse().map_err(|e: LedgerError| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
                )
            })?,
            created_at: timestamp_from_sql(4, &created_at)?,
        })
    }
}

/// Length rule shared by every free-text field we accept.
pub(crate) fn check_length(field: &str, value: &str, min: usize, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(LedgerError::InvalidInput(format!(
            "{} must be {}-{} characters, got {}",
            field, min, max, len
        )));
    }
    Ok(())
}

// ============================================================================
// ACCOUNT REGISTRY
// ============================================================================

/// Store-backed registry of accounts.
///
/// Borrows a connection (or an open store transaction, which derefs to one)
/// so lookups can run inside the ledger's unit of work.
pub struct AccountRegistry<'c> {
    conn: &'c Connection,
}

impl<'c> AccountRegistry<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        AccountRegistry { conn }
    }

    /// Create a new account. Names are unique (exact, case-sensitive match).
    pub fn create_account(
        &self,
        name: &str,
        asset: &str,
        account_type: AccountType,
    ) -> Result<Account> {
        check_length("name", name, 2, 128)?;
        check_length("asset", asset, 1, 16)?;

        if self.find_by_name(name)?.is_some() {
            return Err(LedgerError::DuplicateAccount(name.to_string()));
        }

        let created_at = Utc::now();
        let inserted = self.conn.execute(
            "INSERT INTO accounts (name, asset, type, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, asset, account_type.as_str(), timestamp_to_sql(&created_at)],
        );

        match inserted {
            Ok(_) => {}
            // Lost a race with another writer between the check and the insert
            Err(e) if is_constraint_violation(&e) => {
                return Err(LedgerError::DuplicateAccount(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let account = Account {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            asset: asset.to_string(),
            account_type,
            created_at,
        };

        info!(account_id = account.id, name = %account.name, asset = %account.asset, "account created");

        Ok(account)
    }

    /// All accounts, by id ascending.
    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, asset, type, created_at FROM accounts ORDER BY id")?;

        let accounts = stmt
            .query_map([], Account::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(accounts)
    }

    /// Exact-name lookup. Never creates anything.
    pub fn get_account_by_name(&self, name: &str) -> Result<Account> {
        self.find_by_name(name)?
            .ok_or_else(|| LedgerError::NotFound(format!("account '{}'", name)))
    }

    pub fn get_account_by_id(&self, id: i64) -> Result<Account> {
        self.conn
            .query_row(
                "SELECT id, name, asset, type, created_at FROM accounts WHERE id = ?1",
                [id],
                Account::from_row,
            )
            .optional()?
            .ok_or_else(|| LedgerError::NotFound(format!("account {}", id)))
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Account>> {
        let account = self
            .conn
            .query_row(
                "SELECT id, name, asset, type, created_at FROM accounts WHERE name = ?1",
                [name],
                Account::from_row,
            )
            .optional()?;

        Ok(account)
    }
}

// ============================================================================
// TESTS
// ============================================================================
