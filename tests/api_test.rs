#![cfg(feature = "server")]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use ledger_reconciler::api::{build_router, AppState};
use ledger_reconciler::{
    count_rows, open_in_memory, BankFeedError, BankFeedSource, BankMovement, Settings,
    StaticBankFeed, Table,
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;

struct DownFeed;

impl BankFeedSource for DownFeed {
    fn movements(&self, _asset: &str, _days: u32) -> Result<Vec<BankMovement>, BankFeedError> {
        Err(BankFeedError::Unavailable("bank offline".to_string()))
    }
}

fn test_app(feed: Arc<dyn BankFeedSource>) -> (Router, AppState) {
    let state = AppState::new(open_in_memory().unwrap(), Settings::default(), feed);
    (build_router(state.clone()), state)
}

fn rows(state: &AppState, table: Table) -> i64 {
    count_rows(&state.db.lock().unwrap(), table).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value, idempotency_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = idempotency_key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn create_account(app: &Router, name: &str, account_type: &str) {
    let (status, body) = send(
        app,
        post_json(
            "/accounts",
            &json!({"name": name, "asset": "USD", "type": account_type}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
}

fn sale(reference: &str, debit: &str, credit: &str) -> Value {
    json!({
        "reference": reference,
        "description": "counter sale",
        "asset": "USD",
        "postings": [
            {"account_name": "Cash", "direction": "DEBIT", "amount": debit},
            {"account_name": "Revenue", "direction": "CREDIT", "amount": credit}
        ]
    })
}

#[tokio::test]
async fn test_health() {
    let (app, _) = test_app(Arc::new(StaticBankFeed::default()));

    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["ok"], true);
}

#[tokio::test]
async fn test_post_replay_and_reject_unbalanced() {
    let (app, state) = test_app(Arc::new(StaticBankFeed::default()));
    create_account(&app, "Cash", "ASSET").await;
    create_account(&app, "Revenue", "INCOME").await;

    let (status, first) = send(
        &app,
        post_json("/transactions", &sale("INV-1", "100.00", "100.00"), Some("k1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", first);
    let id = first["data"]["id"].as_i64().unwrap();
    assert_eq!(first["data"]["postings"][0]["account_name"], "Cash");
    assert_eq!(first["data"]["postings"][0]["amount"], "100.00");

    // replay returns the committed transaction
    let (status, replay) = send(
        &app,
        post_json("/transactions", &sale("INV-1", "100.00", "100.00"), Some("k1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["data"]["id"].as_i64(), Some(id));

    let (status, rejected) = send(
        &app,
        post_json("/transactions", &sale("INV-2", "100.00", "90.00"), Some("k2")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(rejected["success"], false);
    assert_eq!(rejected["error"]["code"], "unbalanced_transaction");

    assert_eq!(rows(&state, Table::Transactions), 1);
    assert_eq!(rows(&state, Table::Postings), 2);
    assert_eq!(rows(&state, Table::EventsOutbox), 1);

    let (status, fetched) = send(&app, get(&format!("/transactions/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["data"]["idempotency_key"], "k1");

    let (status, pending) = send(&app, get("/outbox/pending")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending["data"][0]["event_type"], "transaction.created");
    assert_eq!(pending["data"][0]["payload"]["transaction_id"].as_i64(), Some(id));
}

#[tokio::test]
async fn test_missing_idempotency_key_is_rejected() {
    let (app, state) = test_app(Arc::new(StaticBankFeed::default()));
    create_account(&app, "Cash", "ASSET").await;
    create_account(&app, "Revenue", "INCOME").await;

    let (status, body) = send(
        &app,
        post_json("/transactions", &sale("INV-1", "10.00", "10.00"), None),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_input");
    assert_eq!(rows(&state, Table::Transactions), 0);
}

#[tokio::test]
async fn test_malformed_json_is_invalid_input() {
    let (app, _) = test_app(Arc::new(StaticBankFeed::default()));

    let request = Request::builder()
        .method("POST")
        .uri("/transactions")
        .header("content-type", "application/json")
        .header("Idempotency-Key", "k1")
        .body(Body::from("{\"reference\": "))
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_input");
}

#[tokio::test]
async fn test_account_errors() {
    let (app, _) = test_app(Arc::new(StaticBankFeed::default()));
    create_account(&app, "Cash", "ASSET").await;

    let (status, body) = send(
        &app,
        post_json("/accounts", &json!({"name": "Cash", "asset": "USD", "type": "ASSET"}), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "duplicate_account");

    let (status, body) = send(
        &app,
        post_json("/accounts", &json!({"name": "Bank", "asset": "USD", "type": "asset"}), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_input");

    let (status, body) = send(&app, get("/accounts/Nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = send(&app, get("/accounts/Cash")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["type"], "ASSET");

    let (_, body) = send(&app, get("/accounts")).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_limit_is_clamped() {
    let (app, _) = test_app(Arc::new(StaticBankFeed::default()));
    create_account(&app, "Cash", "ASSET").await;
    create_account(&app, "Revenue", "INCOME").await;
    for i in 0..3 {
        let key = format!("k{}", i);
        let (status, _) = send(
            &app,
            post_json("/transactions", &sale(&format!("INV-{}", i), "5.00", "5.00"), Some(&key)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, body) = send(&app, get("/transactions?limit=0")).await;
    let listed = body["data"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["reference"], "INV-2");

    let (_, body) = send(&app, get("/transactions")).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 3);

    let (status, _) = send(&app, get("/transactions/999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reconciliation_run_and_history() {
    let feed = StaticBankFeed::from_amounts("USD", &[dec!(100.00), dec!(50.00)]);
    let (app, _) = test_app(Arc::new(feed));
    create_account(&app, "Cash", "ASSET").await;
    create_account(&app, "Revenue", "INCOME").await;
    send(
        &app,
        post_json("/transactions", &sale("INV-1", "100.00", "100.00"), Some("k1")),
    )
    .await;

    let (status, body) = send(&app, post_json("/reconciliation/run", &json!({}), None)).await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["matched"], 1);
    assert_eq!(body["data"]["missing_in_bank"], 0);
    assert_eq!(body["data"]["missing_in_ledger"], 1);
    assert_eq!(body["data"]["mismatched_amount"], 0);

    let (status, runs) = send(&app, get("/reconciliation/runs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs["data"][0]["status"], "SUCCEEDED");
    assert_eq!(runs["data"][0]["summary"]["matched"], 1);
}

#[tokio::test]
async fn test_reconciliation_failure_is_500_and_recorded() {
    let (app, _) = test_app(Arc::new(DownFeed));

    let (status, body) = send(&app, post_json("/reconciliation/run", &json!({}), None)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "reconciliation_failed");

    let (_, runs) = send(&app, get("/reconciliation/runs")).await;
    assert_eq!(runs["data"][0]["status"], "FAILED");
    assert!(runs["data"][0]["summary"]["error"]
        .as_str()
        .unwrap()
        .contains("bank offline"));
}

#[tokio::test]
async fn test_overflowing_amounts_rejected_and_server_keeps_serving() {
    let (app, state) = test_app(Arc::new(StaticBankFeed::default()));
    create_account(&app, "Cash", "ASSET").await;
    create_account(&app, "Revenue", "INCOME").await;

    let max = "79228162514264337593543950335";
    let body = json!({
        "reference": "BIG-1",
        "asset": "USD",
        "postings": [
            {"account_name": "Cash", "direction": "DEBIT", "amount": max},
            {"account_name": "Cash", "direction": "DEBIT", "amount": max},
            {"account_name": "Revenue", "direction": "CREDIT", "amount": "1"}
        ]
    });
    let (status, rejected) = send(&app, post_json("/transactions", &body, Some("big-1"))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(rejected["error"]["code"], "invalid_amount");
    assert_eq!(rows(&state, Table::Transactions), 0);

    let (status, accounts) = send(&app, get("/accounts")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accounts["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_poisoned_connection_lock_is_recovered() {
    let (app, state) = test_app(Arc::new(StaticBankFeed::default()));
    create_account(&app, "Cash", "ASSET").await;

    let db = state.db.clone();
    let crashed = std::thread::spawn(move || {
        let _guard = db.lock().unwrap();
        panic!("handler crashed while holding the connection");
    })
    .join();
    assert!(crashed.is_err());
    assert!(state.db.is_poisoned());

    let (status, body) = send(&app, get("/accounts/Cash")).await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["name"], "Cash");
    assert!(!state.db.is_poisoned());
}

#[tokio::test]
async fn test_amounts_must_be_decimal_strings() {
    let (app, state) = test_app(Arc::new(StaticBankFeed::default()));
    create_account(&app, "Cash", "ASSET").await;
    create_account(&app, "Revenue", "INCOME").await;

    let numeric = json!({
        "reference": "INV-1",
        "asset": "USD",
        "postings": [
            {"account_name": "Cash", "direction": "DEBIT", "amount": 12345678901.123456},
            {"account_name": "Revenue", "direction": "CREDIT", "amount": 12345678901.123456}
        ]
    });
    let (status, body) = send(&app, post_json("/transactions", &numeric, Some("k1"))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_input");
    assert_eq!(rows(&state, Table::Transactions), 0);

    let (status, body) = send(
        &app,
        post_json(
            "/transactions",
            &sale("INV-1", "12345678901.123456", "12345678901.123456"),
            Some("k1"),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    let id = body["data"]["id"].as_i64().unwrap();
    let (_, stored) = send(&app, get(&format!("/transactions/{}", id))).await;
    assert_eq!(stored["data"]["postings"][0]["amount"], "12345678901.123456");
    assert_eq!(stored["data"]["postings"][1]["amount"], "12345678901.123456");
}
