// Transaction and Posting values
//
// A Transaction owns its ordered postings outright. A Posting points at its
// Account by id; the account name is carried alongside for output and is
// resolved by the store, never by an object graph.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "DEBIT",
            Direction::Credit => "CREDIT",
        }
    }

    /// +1 for debits, -1 for credits, as seen from the debited account.
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            Direction::Debit => amount,
            Direction::Credit => -amount,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(Direction::Debit),
            "CREDIT" => Ok(Direction::Credit),
            other => Err(LedgerError::InvalidInput(format!(
                "direction must be DEBIT or CREDIT, got '{}'",
                other
            ))),
        }
    }
}

/// One committed line of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub id: i64,
    pub account_id: i64,
    pub account_name: String,
    pub direction: Direction,
    pub amount: Decimal,
}

/// A committed, balanced transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub reference: String,
    pub description: Option<String>,
    pub asset: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    /// Submission order
    pub postings: Vec<Posting>,
}

impl Transaction {
    /// None if the sum does not fit in a Decimal.
    pub fn debits_total(&self) -> Option<Decimal> {
        total(self.postings.iter().map(|p| (p.direction, p.amount)), Direction::Debit)
    }

    pub fn credits_total(&self) -> Option<Decimal> {
        total(self.postings.iter().map(|p| (p.direction, p.amount)), Direction::Credit)
    }
}

/// One requested line, before account resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingRequest {
    pub account_name: String,
    pub direction: Direction,
    /// Decimal string only. A JSON number would pass through f64 first.
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

impl PostingRequest {
    pub fn new(account_name: impl Into<String>, direction: Direction, amount: Decimal) -> Self {
        Self {
            account_name: account_name.into(),
            direction,
            amount,
        }
    }

    pub fn debit(account_name: impl Into<String>, amount: Decimal) -> Self {
        Self::new(account_name, Direction::Debit, amount)
    }

    pub fn credit(account_name: impl Into<String>, amount: Decimal) -> Self {
        Self::new(account_name, Direction::Credit, amount)
    }
}

/// Body of a transaction submission. The idempotency key travels separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub reference: String,
    #[serde(default)]
    pub description: Option<String>,
    pub asset: String,
    pub postings: Vec<PostingRequest>,
}

impl NewTransaction {
    /// None if the requested amounts overflow a Decimal when summed.
    pub fn debits_total(&self) -> Option<Decimal> {
        total(self.postings.iter().map(|p| (p.direction, p.amount)), Direction::Debit)
    }

    pub fn credits_total(&self) -> Option<Decimal> {
        total(self.postings.iter().map(|p| (p.direction, p.amount)), Direction::Credit)
    }
}

fn total(lines: impl Iterator<Item = (Direction, Decimal)>, side: Direction) -> Option<Decimal> {
    lines
        .filter(|(direction, _)| *direction == side)
        .try_fold(Decimal::ZERO, |acc, (_, amount)| acc.checked_add(amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_totals_are_exact() {
        let tx = NewTransaction {
            reference: "INV-1".to_string(),
            description: None,
            asset: "USD".to_string(),
            postings: vec![
                PostingRequest::debit("Cash", dec!(0.1)),
                PostingRequest::debit("Cash", dec!(0.2)),
                PostingRequest::credit("Revenue", dec!(0.3)),
            ],
        };

        // 0.1 + 0.2 is exactly 0.3 with decimals
        assert_eq!(tx.debits_total(), Some(dec!(0.3)));
        assert_eq!(tx.debits_total(), tx.credits_total());
    }

    #[test]
    fn test_totals_overflow_is_none() {
        let tx = NewTransaction {
            reference: "INV-1".to_string(),
            description: None,
            asset: "USD".to_string(),
            postings: vec![
                PostingRequest::debit("Cash", Decimal::MAX),
                PostingRequest::debit("Cash", Decimal::MAX),
                PostingRequest::credit("Revenue", dec!(1)),
            ],
        };

        assert_eq!(tx.debits_total(), None);
        assert_eq!(tx.credits_total(), Some(dec!(1)));
    }

    #[test]
    fn test_direction_serde_and_sign() {
        let json = serde_json::to_string(&Direction::Credit).unwrap();
        assert_eq!(json, "\"CREDIT\"");
        assert_eq!(Direction::Credit.signed(dec!(5)), dec!(-5));
        assert_eq!(Direction::Debit.signed(dec!(5)), dec!(5));
        assert!("debit".parse::<Direction>().is_err());
    }

    #[test]
    fn test_posting_request_deserializes_string_amounts() {
        let req: PostingRequest = serde_json::from_str(
            r#"{"account_name": "Cash", "direction": "DEBIT", "amount": "10.00"}"#,
        )
        .unwrap();

        assert_eq!(req.amount, dec!(10.00));
        assert_eq!(req.direction, Direction::Debit);
    }

    #[test]
    fn test_posting_request_keeps_every_digit() {
        let req: PostingRequest = serde_json::from_str(
            r#"{"account_name": "Cash", "direction": "DEBIT", "amount": "12345678901.123456"}"#,
        )
        .unwrap();
        assert_eq!(req.amount.to_string(), "12345678901.123456");

        let numeric = serde_json::from_str::<PostingRequest>(
            r#"{"account_name": "Cash", "direction": "DEBIT", "amount": 12345678901.123456}"#,
        );
        assert!(numeric.is_err());
    }
}
