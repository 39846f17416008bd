// Ledger Reconciler - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod bank_feed;
pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod ledger;
pub mod observability;
pub mod outbox;
pub mod reconciliation;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use bank_feed::{BankFeedError, BankFeedSource, BankMovement, CsvBankFeed, MockBankFeed, StaticBankFeed};
pub use config::{BankFeedConfig, ConfigError, ReconciliationSettings, Settings};
pub use db::{count_rows, open_database, open_in_memory, setup_database, Table};
pub use entities::{
    Account, AccountRegistry, AccountType,
    Direction, NewTransaction, Posting, PostingRequest, Transaction,
};
pub use error::{LedgerError, Result};
pub use ledger::Ledger;
pub use outbox::{EventOutboxEntry, Outbox, TRANSACTION_CREATED};
pub use reconciliation::{
    match_movements, MatchCounts, ReconciliationEngine, ReconciliationRun,
    ReconciliationSummary, RunStatus, RunStore,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
