// Bank feed sources
//
// The reconciliation engine only needs signed amounts per asset and window.
// Real providers sit behind `BankFeedSource`; this module ships a seeded mock
// feed, a CSV file feed and a fixed in-memory feed.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::BankFeedConfig;

#[derive(Debug, Error)]
pub enum BankFeedError {
    #[error("bank feed unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read bank feed {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("malformed bank feed row {line}: {message}")]
    MalformedRow { line: u64, message: String },
}

/// One booked movement on the bank side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankMovement {
    pub reference: String,
    pub booked_at: DateTime<Utc>,
    /// Positive for incoming, negative for outgoing
    pub amount: Decimal,
    pub currency: String,
}

pub trait BankFeedSource: Send + Sync {
    /// Movements for `asset` booked within the last `lookback_days`.
    fn movements(&self, asset: &str, lookback_days: u32) -> Result<Vec<BankMovement>, BankFeedError>;
}

/// Build the configured feed.
pub fn from_config(config: &BankFeedConfig) -> Box<dyn BankFeedSource> {
    match config {
        BankFeedConfig::Mock => Box::new(MockBankFeed::new()),
        BankFeedConfig::Csv(path) => Box::new(CsvBankFeed::new(path)),
    }
}

// ============================================================================
// MOCK FEED
// ============================================================================

const MOCK_MOVEMENT_COUNT: u32 = 15;
const MOCK_AMOUNTS: [i64; 6] = [25, 50, 75, 100, 150, 200];
/// Roughly 35% of mock movements are outgoing.
const MOCK_OUTGOING_THRESHOLD: u8 = 89;

/// Generated feed. The same `(asset, lookback_days)` always yields the same
/// references, amounts and day offsets; only `booked_at` moves with the clock.
#[derive(Debug, Clone, Default)]
pub struct MockBankFeed;

impl MockBankFeed {
    pub fn new() -> Self {
        MockBankFeed
    }

    fn draw(seed: &str, index: u32) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(index.to_be_bytes());
        hasher.finalize().into()
    }
}

impl BankFeedSource for MockBankFeed {
    fn movements(&self, asset: &str, lookback_days: u32) -> Result<Vec<BankMovement>, BankFeedError> {
        let now = Utc::now();
        let seed = format!("{}{}", asset, lookback_days);

        let movements = (0..MOCK_MOVEMENT_COUNT)
            .map(|i| {
                let bytes = Self::draw(&seed, i);
                let base = MOCK_AMOUNTS[bytes[0] as usize % MOCK_AMOUNTS.len()];
                let mut amount = Decimal::new(base * 100, 2);
                if bytes[1] < MOCK_OUTGOING_THRESHOLD {
                    amount = -amount;
                }
                let days_ago = i64::from(
                    u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]])
                        % lookback_days.saturating_add(1),
                );

                BankMovement {
                    reference: format!("BANK-{:04}", i),
                    booked_at: now - Duration::days(days_ago),
                    amount,
                    currency: asset.to_string(),
                }
            })
            .collect();

        Ok(movements)
    }
}

// ============================================================================
// CSV FEED
// ============================================================================

#[derive(Debug, Deserialize)]
struct CsvRow {
    reference: String,
    booked_at: String,
    amount: String,
    currency: String,
}

/// Statement export with a `reference,booked_at,amount,currency` header.
/// `booked_at` is RFC 3339; amounts are signed decimals.
#[derive(Debug, Clone)]
pub struct CsvBankFeed {
    path: PathBuf,
}

impl CsvBankFeed {
    pub fn new(path: impl AsRef<Path>) -> Self {
        CsvBankFeed {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn parse_row(row: CsvRow, line: u64) -> Result<BankMovement, BankFeedError> {
        let malformed = |message: String| BankFeedError::MalformedRow { line, message };

        let amount = Decimal::from_str(row.amount.trim())
            .map_err(|e| malformed(format!("amount '{}': {}", row.amount, e)))?;
        let booked_at = DateTime::parse_from_rfc3339(row.booked_at.trim())
            .map_err(|e| malformed(format!("booked_at '{}': {}", row.booked_at, e)))?
            .with_timezone(&Utc);

        Ok(BankMovement {
            reference: row.reference,
            booked_at,
            amount,
            currency: row.currency.trim().to_string(),
        })
    }
}

impl BankFeedSource for CsvBankFeed {
    fn movements(&self, asset: &str, lookback_days: u32) -> Result<Vec<BankMovement>, BankFeedError> {
        let csv_error = |source: csv::Error| BankFeedError::Csv {
            path: self.path.clone(),
            source,
        };

        let mut rdr = csv::Reader::from_path(&self.path).map_err(csv_error)?;
        let cutoff = Utc::now() - Duration::days(i64::from(lookback_days));

        let mut movements = Vec::new();
        for (idx, result) in rdr.deserialize::<CsvRow>().enumerate() {
            let row = result.map_err(csv_error)?;
            // header is line 1
            let line = idx as u64 + 2;
            let movement = Self::parse_row(row, line)?;

            if movement.currency == asset && movement.booked_at >= cutoff {
                movements.push(movement);
            }
        }

        Ok(movements)
    }
}

// ============================================================================
// STATIC FEED
// ============================================================================

/// Fixed list of movements, filtered by currency only.
#[derive(Debug, Clone, Default)]
pub struct StaticBankFeed {
    movements: Vec<BankMovement>,
}

impl StaticBankFeed {
    pub fn new(movements: Vec<BankMovement>) -> Self {
        StaticBankFeed { movements }
    }

    /// Convenience for amount-only feeds.
    pub fn from_amounts(currency: &str, amounts: &[Decimal]) -> Self {
        let now = Utc::now();
        let movements = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| BankMovement {
                reference: format!("STATIC-{:04}", i),
                booked_at: now,
                amount: *amount,
                currency: currency.to_string(),
            })
            .collect();

        StaticBankFeed { movements }
    }
}

impl BankFeedSource for StaticBankFeed {
    fn movements(&self, asset: &str, _lookback_days: u32) -> Result<Vec<BankMovement>, BankFeedError> {
        Ok(self
            .movements
            .iter()
            .filter(|m| m.currency == asset)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_mock_feed_is_deterministic() {
        let feed = MockBankFeed::new();

        let a = feed.movements("USD", 14).unwrap();
        let b = feed.movements("USD", 14).unwrap();

        assert_eq!(a.len(), 15);
        let amounts_a: Vec<Decimal> = a.iter().map(|m| m.amount).collect();
        let amounts_b: Vec<Decimal> = b.iter().map(|m| m.amount).collect();
        assert_eq!(amounts_a, amounts_b);
        assert_eq!(a[0].reference, "BANK-0000");
        assert_eq!(a[14].reference, "BANK-0014");
    }

    #[test]
    fn test_mock_feed_amounts_and_window() {
        let feed = MockBankFeed::new();
        let now = Utc::now();

        for m in feed.movements("EUR", 7).unwrap() {
            assert!(MOCK_AMOUNTS.iter().any(|base| Decimal::from(*base) == m.amount.abs()));
            assert_eq!(m.amount.scale(), 2);
            assert_eq!(m.currency, "EUR");
            assert!(m.booked_at <= now + Duration::seconds(1));
            assert!(m.booked_at >= now - Duration::days(8));
        }
    }

    #[test]
    fn test_mock_feed_differs_by_seed() {
        let feed = MockBankFeed::new();

        let usd: Vec<Decimal> = feed.movements("USD", 14).unwrap().iter().map(|m| m.amount).collect();
        let eur: Vec<Decimal> = feed.movements("EUR", 14).unwrap().iter().map(|m| m.amount).collect();

        assert_ne!(usd, eur);
    }

    fn write_temp_csv(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("bank-feed-{}.csv", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_csv_feed_filters_asset_and_window() {
        let recent = (Utc::now() - Duration::days(1)).to_rfc3339();
        let old = (Utc::now() - Duration::days(60)).to_rfc3339();
        let path = write_temp_csv(&format!(
            "reference,booked_at,amount,currency\n\
             B-1,{recent},100.00,USD\n\
             B-2,{recent},-50.25,USD\n\
             B-3,{recent},75.00,EUR\n\
             B-4,{old},10.00,USD\n"
        ));

        let feed = CsvBankFeed::new(&path);
        let movements = feed.movements("USD", 14).unwrap();
        std::fs::remove_file(&path).ok();

        let amounts: Vec<Decimal> = movements.iter().map(|m| m.amount).collect();
        assert_eq!(amounts, vec![dec!(100.00), dec!(-50.25)]);
        assert_eq!(movements[0].reference, "B-1");
    }

    #[test]
    fn test_csv_feed_rejects_malformed_amount() {
        let now = Utc::now().to_rfc3339();
        let path = write_temp_csv(&format!(
            "reference,booked_at,amount,currency\nB-1,{now},lots,USD\n"
        ));

        let err = CsvBankFeed::new(&path).movements("USD", 14).unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(matches!(err, BankFeedError::MalformedRow { line: 2, .. }));
    }

    #[test]
    fn test_csv_feed_missing_file() {
        let feed = CsvBankFeed::new("/definitely/not/here.csv");
        assert!(matches!(
            feed.movements("USD", 14),
            Err(BankFeedError::Csv { .. })
        ));
    }

    #[test]
    fn test_static_feed_filters_currency() {
        let mut feed = StaticBankFeed::from_amounts("USD", &[dec!(1), dec!(2)]).movements;
        feed.push(BankMovement {
            reference: "X".into(),
            booked_at: Utc::now(),
            amount: dec!(3),
            currency: "EUR".into(),
        });

        let feed = StaticBankFeed::new(feed);
        assert_eq!(feed.movements("USD", 0).unwrap().len(), 2);
        assert_eq!(feed.movements("EUR", 0).unwrap().len(), 1);
    }
}
