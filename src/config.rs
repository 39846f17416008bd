// Process configuration
//
// Built once at startup from FP_* environment variables and handed to each
// component by reference. Core logic never reads the environment itself.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_DATABASE_PATH: &str = "./ledger.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_RECONCILIATION_ASSET: &str = "USD";
pub const DEFAULT_CASH_SELECTOR: &str = "cash";
pub const DEFAULT_WINDOW_DAYS: u32 = 14;
pub const DEFAULT_STALE_RUN_AFTER_SECS: u64 = 3600;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got '{value}'")]
    InvalidValue {
        key: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Where the reconciliation engine gets its external movements from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankFeedConfig {
    /// Deterministic generated feed.
    Mock,
    /// `reference,booked_at,amount,currency` rows from a file.
    Csv(PathBuf),
}

impl FromStr for BankFeedConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("mock") {
            return Ok(BankFeedConfig::Mock);
        }
        match s.strip_prefix("csv:") {
            Some(path) if !path.is_empty() => Ok(BankFeedConfig::Csv(PathBuf::from(path))),
            _ => Err(ConfigError::InvalidValue {
                key: "FP_BANK_FEED",
                expected: "'mock' or 'csv:<path>'",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationSettings {
    /// Only transactions in this asset take part in a run.
    pub asset: String,
    /// Case-insensitive substring selecting the internal cash accounts.
    pub cash_account_selector: String,
    /// Lookback window requested from the bank feed.
    pub window_days: u32,
    /// RUNNING runs older than this are failed at startup. `None` disables.
    pub stale_run_after: Option<Duration>,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            asset: DEFAULT_RECONCILIATION_ASSET.to_string(),
            cash_account_selector: DEFAULT_CASH_SELECTOR.to_string(),
            window_days: DEFAULT_WINDOW_DAYS,
            stale_run_after: Some(Duration::from_secs(DEFAULT_STALE_RUN_AFTER_SECS)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_path: PathBuf,
    pub bind_addr: String,
    pub reconciliation: ReconciliationSettings,
    pub bank_feed: BankFeedConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            reconciliation: ReconciliationSettings::default(),
            bank_feed: BankFeedConfig::Mock,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup. Unset keys keep their
    /// defaults; set-but-invalid keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(path) = lookup("FP_DATABASE_PATH") {
            settings.database_path = PathBuf::from(non_empty("FP_DATABASE_PATH", path)?);
        }
        if let Some(addr) = lookup("FP_BIND_ADDR") {
            settings.bind_addr = non_empty("FP_BIND_ADDR", addr)?;
        }
        if let Some(asset) = lookup("FP_RECONCILIATION_ASSET") {
            settings.reconciliation.asset = non_empty("FP_RECONCILIATION_ASSET", asset)?;
        }
        if let Some(selector) = lookup("FP_CASH_ACCOUNT_SELECTOR") {
            settings.reconciliation.cash_account_selector =
                non_empty("FP_CASH_ACCOUNT_SELECTOR", selector)?;
        }
        if let Some(days) = lookup("FP_RECONCILIATION_WINDOW_DAYS") {
            settings.reconciliation.window_days = days.trim().parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "FP_RECONCILIATION_WINDOW_DAYS",
                    expected: "a non-negative integer",
                    value: days.clone(),
                }
            })?;
        }
        if let Some(secs) = lookup("FP_STALE_RUN_AFTER_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "FP_STALE_RUN_AFTER_SECS",
                expected: "a non-negative integer",
                value: secs.clone(),
            })?;
            // 0 turns the reaper off
            settings.reconciliation.stale_run_after =
                (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(feed) = lookup("FP_BANK_FEED") {
            settings.bank_feed = feed.parse()?;
        }

        Ok(settings)
    }
}

fn non_empty(key: &'static str, value: String) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Empty(key));
    }
    Ok(trimmed.to_string())
}
