//! Shared fixtures for integration tests.

#![allow(dead_code)]

use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;

use edgebus::domain::NewCommand;
use edgebus::SqliteOutbox;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// In-memory sqlite store with the full schema applied. One connection,
/// matching production single-writer discipline.
pub async fn sqlite_store_with_cap(max_attempts: u32) -> SqliteOutbox {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    edgebus::migrations::sqlite_migrator()
        .run(&pool)
        .await
        .expect("apply migrations");
    SqliteOutbox::new(pool, max_attempts)
}

pub async fn sqlite_store() -> SqliteOutbox {
    sqlite_store_with_cap(DEFAULT_MAX_ATTEMPTS).await
}

pub fn order_payload(symbol: &str) -> Value {
    json!({
        "venue": "KRAKEN",
        "symbol": symbol,
        "side": "BUY",
        "mode": "SPOT",
        "quote_amount": 250.0,
    })
}

pub fn new_command(agent: &str, payload: Value) -> NewCommand {
    NewCommand {
        agent_id: agent.to_string(),
        kind: "order.place".to_string(),
        payload,
        not_before: None,
        dedupe_key: None,
    }
}
