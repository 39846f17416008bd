// Ledger Reconciler - Web Server

use std::sync::Arc;

use anyhow::{Context, Result};
use ledger_reconciler::api::{build_router, AppState};
use ledger_reconciler::reconciliation::RunStore;
use ledger_reconciler::{bank_feed, observability, open_database, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;

    let conn = open_database(&settings.database_path)
        .with_context(|| format!("failed to open database {:?}", settings.database_path))?;
    info!(path = ?settings.database_path, "database opened");

    // Runs left RUNNING by a previous process
    if let Some(max_age) = settings.reconciliation.stale_run_after {
        RunStore::new(&conn)
            .reap_stale_runs(max_age)
            .context("failed to reap stale reconciliation runs")?;
    }

    let feed: Arc<dyn bank_feed::BankFeedSource> = Arc::from(bank_feed::from_config(&settings.bank_feed));
    let bind_addr = settings.bind_addr.clone();
    let app = build_router(AppState::new(conn, settings, feed));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
