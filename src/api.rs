// Ledger Reconciler - REST API with Axum
//
// Every response is wrapped as `{success, data}` or
// `{success: false, error: {code, message}}`. Handlers lock the shared
// connection for the duration of one operation; SQLite serialises the rest.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::bank_feed::BankFeedSource;
use crate::config::Settings;
use crate::entities::{Account, AccountRegistry, AccountType, NewTransaction, Transaction};
use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::outbox::{EventOutboxEntry, Outbox};
use crate::reconciliation::{ReconciliationEngine, ReconciliationRun, ReconciliationSummary, RunStore};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

const DEFAULT_PAGE_SIZE: i64 = 50;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub settings: Arc<Settings>,
    pub bank_feed: Arc<dyn BankFeedSource>,
}

impl AppState {
    pub fn new(conn: Connection, settings: Settings, bank_feed: Arc<dyn BankFeedSource>) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            settings: Arc::new(settings),
            bank_feed,
        }
    }

    /// Lock the shared connection, taking over a lock poisoned by a
    /// panicking handler. Any open store transaction was rolled back on drop.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| {
            warn!("database mutex was poisoned by a panicking request, recovering");
            self.db.clear_poison();
            poisoned.into_inner()
        })
    }
}

// ============================================================================
// Response envelope
// ============================================================================

/// API Response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_input",
            message: message.into(),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: "internal error".to_string(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::RunAlreadyFinalized(_) => StatusCode::CONFLICT,
            LedgerError::ReconciliationFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LedgerError::Storage(_)
            | LedgerError::Serialization(_)
            | LedgerError::StorageConflict(_)
            | LedgerError::BankFeed(_) => {
                // keep storage internals out of the response
                error!(error = %err, code = err.code(), "request failed");
                return ApiError::internal();
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        ApiError {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: self.code,
                message: self.message,
            }),
        };

        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub name: String,
    pub asset: String,
    /// Parsed by the registry so a bad kind reads as `invalid_input`
    #[serde(rename = "type")]
    pub account_type: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
}

impl PageQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /health
async fn health_check() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::ok(HealthResponse { ok: true }))
}

/// POST /accounts
async fn create_account(
    State(state): State<AppState>,
    body: Result<Json<CreateAccountRequest>, JsonRejection>,
) -> ApiResult<Account> {
    let Json(req) = body?;
    let account_type: AccountType = req.account_type.parse()?;

    let conn = state.conn();
    let account = AccountRegistry::new(&conn).create_account(&req.name, &req.asset, account_type)?;

    Ok(Json(ApiResponse::ok(account)))
}

/// GET /accounts
async fn list_accounts(State(state): State<AppState>) -> ApiResult<Vec<Account>> {
    let conn = state.conn();
    let accounts = AccountRegistry::new(&conn).list_accounts()?;

    Ok(Json(ApiResponse::ok(accounts)))
}

/// GET /accounts/:name
async fn get_account(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Account> {
    let conn = state.conn();
    let account = AccountRegistry::new(&conn).get_account_by_name(&name)?;

    Ok(Json(ApiResponse::ok(account)))
}

/// POST /transactions - requires an Idempotency-Key header
async fn submit_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<NewTransaction>, JsonRejection>,
) -> ApiResult<Transaction> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .ok_or_else(|| ApiError::bad_request("missing Idempotency-Key header"))?
        .to_str()
        .map_err(|_| ApiError::bad_request("Idempotency-Key header must be visible ASCII"))?
        .to_string();
    let Json(request) = body?;

    let conn = state.conn();
    let transaction = Ledger::new(&conn).submit_transaction(&request, &key)?;

    Ok(Json(ApiResponse::ok(transaction)))
}

/// GET /transactions?limit=N
async fn list_transactions(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<Transaction>> {
    let conn = state.conn();
    let transactions = Ledger::new(&conn).list_transactions(page.limit())?;

    Ok(Json(ApiResponse::ok(transactions)))
}

/// GET /transactions/:id
async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Transaction> {
    let conn = state.conn();
    let transaction = Ledger::new(&conn).get_transaction(id)?;

    Ok(Json(ApiResponse::ok(transaction)))
}

/// POST /reconciliation/run
async fn run_reconciliation(State(state): State<AppState>) -> ApiResult<ReconciliationSummary> {
    let conn = state.conn();
    let engine = ReconciliationEngine::new(&state.settings.reconciliation, state.bank_feed.as_ref());
    let summary = engine.run(&conn)?;

    Ok(Json(ApiResponse::ok(summary)))
}

/// GET /reconciliation/runs?limit=N
async fn list_runs(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<ReconciliationRun>> {
    let conn = state.conn();
    let runs = RunStore::new(&conn).list_runs(page.limit())?;

    Ok(Json(ApiResponse::ok(runs)))
}

/// GET /outbox/pending?limit=N
async fn pending_events(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<EventOutboxEntry>> {
    let conn = state.conn();
    let entries = Outbox::new(&conn).pending(page.limit())?;

    Ok(Json(ApiResponse::ok(entries)))
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/accounts", post(create_account).get(list_accounts))
        .route("/accounts/:name", get(get_account))
        .route("/transactions", post(submit_transaction).get(list_transactions))
        .route("/transactions/:id", get(get_transaction))
        .route("/reconciliation/run", post(run_reconciliation))
        .route("/reconciliation/runs", get(list_runs))
        .route("/outbox/pending", get(pending_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
