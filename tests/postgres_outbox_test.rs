//! Postgres backend tests. Require a running database:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/edgebus_test cargo test -- --ignored
//! ```
//!
//! Tables are truncated between tests, so point this at a throwaway
//! database.

mod common;

use chrono::{Duration, Utc};
use serde_json::json;

use common::{new_command, order_payload};
use edgebus::domain::{AckOutcome, AckReport, CommandStatus};
use edgebus::{CommandStore, PgOutbox};

async fn pg_store() -> PgOutbox {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect to postgres");
    edgebus::migrations::postgres_migrator()
        .run(&pool)
        .await
        .expect("apply migrations");
    sqlx::query("TRUNCATE receipts, commands, agent_authority RESTART IDENTITY")
        .execute(&pool)
        .await
        .expect("truncate");
    PgOutbox::new(pool, 5)
}

#[tokio::test]
#[ignore]
async fn enqueue_pull_ack_cycle() {
    let store = pg_store().await;
    let now = Utc::now();

    let outcome = store
        .enqueue(new_command("edge-1", order_payload("BTC/USD")), now)
        .await
        .unwrap();
    let dup = store
        .enqueue(new_command("edge-1", order_payload("BTC/USD")), now)
        .await
        .unwrap();
    assert!(dup.is_duplicate());
    assert_eq!(outcome.id(), dup.id());

    let leased = store.pull("edge-1", 10, 45, now).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].attempts, 1);
    assert!(store.pull("edge-1", 10, 45, now).await.unwrap().is_empty());

    let ack = store
        .ack(
            AckReport {
                agent_id: "edge-1".to_string(),
                cmd_id: outcome.id(),
                ok: true,
                status: Some("filled".to_string()),
                txid: None,
                message: None,
                result: json!({}),
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(
        ack,
        AckOutcome::Applied {
            status: CommandStatus::Done
        }
    );
    assert!(store.get_receipt(outcome.id()).await.unwrap().is_some());
}

#[tokio::test]
#[ignore]
async fn concurrent_pulls_do_not_double_lease() {
    let store = std::sync::Arc::new(pg_store().await);
    let now = Utc::now();
    for n in 0..20 {
        store
            .enqueue(new_command("edge-1", json!({"n": n})), now)
            .await
            .unwrap();
    }

    // Race many pulls; SKIP LOCKED must partition the set cleanly.
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.pull("edge-1", 10, 45, now).await.unwrap()
        }));
    }
    let mut seen = std::collections::HashSet::new();
    let mut total = 0;
    for task in tasks {
        for cmd in task.await.unwrap() {
            assert!(seen.insert(cmd.id), "command {} leased twice", cmd.id);
            total += 1;
        }
    }
    assert_eq!(total, 20);
}

#[tokio::test]
#[ignore]
async fn expired_lease_recycles_and_retires_at_cap() {
    let store = pg_store().await;
    let mut now = Utc::now();
    let id = store
        .enqueue(new_command("edge-1", order_payload("BTC/USD")), now)
        .await
        .unwrap()
        .id();

    for attempt in 1..=5 {
        let leased = store.pull("edge-1", 1, 45, now).await.unwrap();
        assert_eq!(leased[0].attempts, attempt);
        now = now + Duration::seconds(46);
    }
    let summary = store.reap_expired(now).await.unwrap();
    assert_eq!(summary.failed, 1);

    let cmd = store.get_command(id).await.unwrap().unwrap();
    assert_eq!(cmd.status, CommandStatus::Error);
    let receipt = store.get_receipt(id).await.unwrap().unwrap();
    assert_eq!(receipt.result["reason"], "max_attempts_exceeded");
}
