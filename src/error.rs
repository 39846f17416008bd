// Error taxonomy for the ledger core, the outbox and the reconciliation engine.
//
// Every domain rule violation is detected before the store is touched, so a
// caller that receives one of the client-side variants can rely on zero
// partial state.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::bank_feed::BankFeedError;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed or out-of-range field.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("account already exists: {0}")]
    DuplicateAccount(String),

    #[error("transaction not balanced: debits={debits_total} credits={credits_total}")]
    UnbalancedTransaction {
        debits_total: Decimal,
        credits_total: Decimal,
    },

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("asset mismatch for {account}: account={account_asset} tx={tx_asset}")]
    AssetMismatch {
        account: String,
        account_asset: String,
        tx_asset: String,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Idempotency-key uniqueness race. Recovered inside the ledger core and
    /// never returned from `Ledger::submit_transaction`.
    #[error("idempotency key already committed: {0}")]
    StorageConflict(String),

    #[error("reconciliation failed: {0}")]
    ReconciliationFailure(String),

    #[error("reconciliation run {0} is already finalized")]
    RunAlreadyFinalized(i64),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    BankFeed(#[from] BankFeedError),
}

impl LedgerError {
    /// Caller errors: reported as a client error and never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidInput(_)
                | LedgerError::DuplicateAccount(_)
                | LedgerError::UnbalancedTransaction { .. }
                | LedgerError::UnknownAccount(_)
                | LedgerError::AssetMismatch { .. }
                | LedgerError::InvalidAmount(_)
        )
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidInput(_) => "invalid_input",
            LedgerError::DuplicateAccount(_) => "duplicate_account",
            LedgerError::UnbalancedTransaction { .. } => "unbalanced_transaction",
            LedgerError::UnknownAccount(_) => "unknown_account",
            LedgerError::AssetMismatch { .. } => "asset_mismatch",
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::StorageConflict(_) => "storage_conflict",
            LedgerError::ReconciliationFailure(_) => "reconciliation_failed",
            LedgerError::RunAlreadyFinalized(_) => "run_already_finalized",
            LedgerError::Storage(_) => "storage_error",
            LedgerError::Serialization(_) => "serialization_error",
            LedgerError::BankFeed(_) => "bank_feed_error",
        }
    }
}

/// True when a rusqlite error is a UNIQUE/constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;
