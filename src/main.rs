// Ledger Reconciler - command line
//
// Every subcommand opens the configured database, runs one operation and
// prints its result as JSON on stdout.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;

use ledger_reconciler::{
    bank_feed, observability, open_database, AccountRegistry, AccountType, Direction, Ledger,
    NewTransaction, Outbox, PostingRequest, ReconciliationEngine, RunStore, Settings,
};

#[derive(Parser, Debug)]
#[command(name = "ledger-reconciler", version, about = "Double-entry ledger with bank reconciliation")]
struct Cli {
    /// SQLite database file (overrides FP_DATABASE_PATH).
    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database file and schema.
    Init,
    /// Manage accounts.
    #[command(subcommand)]
    Account(AccountCommand),
    /// Post and list transactions.
    #[command(subcommand)]
    Tx(TxCommand),
    /// Run one reconciliation against the configured bank feed.
    Reconcile,
    /// Show recent reconciliation runs.
    Runs {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
    /// Inspect and acknowledge outbox events.
    #[command(subcommand)]
    Outbox(OutboxCommand),
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    Create {
        name: String,
        #[arg(short, long)]
        asset: String,
        /// ASSET, LIABILITY, INCOME, EXPENSE or EQUITY
        #[arg(short = 't', long = "type")]
        account_type: String,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum TxCommand {
    Post(PostArgs),
    List {
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Args, Debug)]
struct PostArgs {
    /// Idempotency key; re-posting with the same key returns the first result.
    #[arg(short, long)]
    key: String,

    #[arg(short, long)]
    reference: String,

    #[arg(short, long)]
    asset: String,

    #[arg(short, long)]
    description: Option<String>,

    /// DIRECTION:AMOUNT:ACCOUNT, e.g. DEBIT:100.00:Cash. Repeat per line.
    #[arg(short, long = "posting", value_parser = parse_posting, required = true)]
    postings: Vec<PostingRequest>,
}

#[derive(Subcommand, Debug)]
enum OutboxCommand {
    Pending {
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
    /// Mark an entry processed.
    Ack { id: i64 },
}

fn parse_posting(raw: &str) -> Result<PostingRequest, String> {
    let mut parts = raw.splitn(3, ':');
    let (Some(direction), Some(amount), Some(account)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected DIRECTION:AMOUNT:ACCOUNT, got '{}'", raw));
    };

    let direction = Direction::from_str(&direction.to_uppercase()).map_err(|e| e.to_string())?;
    let amount = Decimal::from_str(amount.trim()).map_err(|e| format!("amount '{}': {}", amount, e))?;

    Ok(PostingRequest::new(account, direction, amount))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    observability::init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env().context("invalid configuration")?;
    if let Some(path) = cli.database {
        settings.database_path = path;
    }

    let conn = open_database(&settings.database_path)
        .with_context(|| format!("failed to open database {:?}", settings.database_path))?;

    match cli.command {
        Command::Init => {
            println!("✓ Database initialized: {:?}", settings.database_path);
        }

        Command::Account(AccountCommand::Create { name, asset, account_type }) => {
            let account_type = AccountType::from_str(&account_type)?;
            let account = AccountRegistry::new(&conn).create_account(&name, &asset, account_type)?;
            print_json(&account)?;
        }
        Command::Account(AccountCommand::List) => {
            print_json(&AccountRegistry::new(&conn).list_accounts()?)?;
        }

        Command::Tx(TxCommand::Post(args)) => {
            let request = NewTransaction {
                reference: args.reference,
                description: args.description,
                asset: args.asset,
                postings: args.postings,
            };
            let transaction = Ledger::new(&conn).submit_transaction(&request, &args.key)?;
            print_json(&transaction)?;
        }
        Command::Tx(TxCommand::List { limit }) => {
            print_json(&Ledger::new(&conn).list_transactions(limit)?)?;
        }

        Command::Reconcile => {
            let feed = bank_feed::from_config(&settings.bank_feed);
            let summary = ReconciliationEngine::new(&settings.reconciliation, feed.as_ref())
                .run(&conn)?;
            print_json(&summary)?;
        }
        Command::Runs { limit } => {
            print_json(&RunStore::new(&conn).list_runs(limit)?)?;
        }

        Command::Outbox(OutboxCommand::Pending { limit }) => {
            print_json(&Outbox::new(&conn).pending(limit)?)?;
        }
        Command::Outbox(OutboxCommand::Ack { id }) => {
            let processed_at = Outbox::new(&conn).mark_processed(id)?;
            println!("✓ Outbox entry {} processed at {}", id, processed_at.to_rfc3339());
        }
    }

    Ok(())
}
