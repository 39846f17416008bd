// Entity models
//
// Accounts are looked up by name and referenced by id. Transactions own
// their postings as plain values.

pub mod account;
pub mod transaction;

pub use account::{Account, AccountRegistry, AccountType};
pub use transaction::{Direction, NewTransaction, Posting, PostingRequest, Transaction};
