//! SQLite command store.
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED`, so lease claims run as a
//! select-then-update inside a transaction and the crate keeps writer
//! concurrency at one connection (the pool is built with
//! `max_connections(1)`). The observable semantics match the Postgres
//! store exactly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::crypto::intent_hash;
use crate::domain::{
    AckOutcome, AckRejection, AckReport, Command, CommandFilter, CommandStatus, EnqueueOutcome,
    LeasedCommand, NewCommand, ReapSummary, Receipt,
};
use crate::infra::error::{OutboxError, Result};
use crate::infra::traits::CommandStore;

/// SQLite-backed outbox for single-node deployments.
pub struct SqliteOutbox {
    pool: SqlitePool,
    max_attempts: i64,
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| OutboxError::Internal(format!("timestamp out of range: {secs}")))
}

fn opt_from_ts(secs: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    secs.map(from_ts).transpose()
}

fn command_from_row(row: &SqliteRow) -> Result<Command> {
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    Ok(Command {
        id: row.try_get("id")?,
        created_at: from_ts(row.try_get("created_at")?)?,
        agent_id: row.try_get("agent_id")?,
        kind: row.try_get("kind")?,
        payload: serde_json::from_str(&payload)?,
        not_before: opt_from_ts(row.try_get("not_before")?)?,
        dedupe_key: row.try_get("dedupe_key")?,
        intent_hash: row.try_get("intent_hash")?,
        status: CommandStatus::parse(&status)?,
        leased_by: row.try_get("leased_by")?,
        lease_at: opt_from_ts(row.try_get("lease_at")?)?,
        lease_expires_at: opt_from_ts(row.try_get("lease_expires_at")?)?,
        attempts: row.try_get("attempts")?,
    })
}

const COMMAND_COLUMNS: &str = "id, created_at, agent_id, kind, payload, not_before, dedupe_key, \
     intent_hash, status, leased_by, lease_at, lease_expires_at, attempts";

impl SqliteOutbox {
    pub fn new(pool: SqlitePool, max_attempts: u32) -> Self {
        Self {
            pool,
            max_attempts: i64::from(max_attempts.max(1)),
        }
    }

    async fn find_live_by_dedupe(
        tx: &mut Transaction<'_, Sqlite>,
        agent_id: &str,
        key: &str,
    ) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM commands
             WHERE agent_id = ? AND dedupe_key = ? AND status IN ('pending', 'leased')
             LIMIT 1",
        )
        .bind(agent_id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(id)
    }

    async fn find_live_by_intent(
        tx: &mut Transaction<'_, Sqlite>,
        agent_id: &str,
        hash: &str,
    ) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM commands
             WHERE agent_id = ? AND intent_hash = ? AND status IN ('pending', 'leased')
             LIMIT 1",
        )
        .bind(agent_id)
        .bind(hash)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(id)
    }

    /// Shared reap pass, run inline before every pull (scoped to one agent)
    /// and by the background reaper (unscoped). Over-cap leases are retired
    /// to error with a synthetic receipt before the recycle sweep so the
    /// same row is never counted twice.
    async fn reap_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReapSummary> {
        let mut select = String::from(
            "SELECT id, agent_id FROM commands
             WHERE status = 'leased' AND lease_expires_at IS NOT NULL
               AND lease_expires_at <= ? AND attempts >= ?",
        );
        if agent_id.is_some() {
            select.push_str(" AND agent_id = ?");
        }
        let mut q = sqlx::query(&select).bind(ts(now)).bind(self.max_attempts);
        if let Some(agent) = agent_id {
            q = q.bind(agent);
        }
        let exhausted = q.fetch_all(&mut **tx).await?;

        let mut failed = 0u64;
        for row in &exhausted {
            let id: i64 = row.try_get("id")?;
            let owner: String = row.try_get("agent_id")?;
            sqlx::query(
                "INSERT OR IGNORE INTO receipts
                     (cmd_id, agent_id, ok, status, message, received_at, result)
                 VALUES (?, ?, 0, 'error', 'max_attempts_exceeded', ?, ?)",
            )
            .bind(id)
            .bind(&owner)
            .bind(ts(now))
            .bind(r#"{"reason":"max_attempts_exceeded"}"#)
            .execute(&mut **tx)
            .await?;
            sqlx::query(
                "UPDATE commands
                 SET status = 'error', leased_by = NULL, lease_at = NULL, lease_expires_at = NULL
                 WHERE id = ? AND status = 'leased'",
            )
            .bind(id)
            .execute(&mut **tx)
            .await?;
            failed += 1;
        }

        let mut recycle = String::from(
            "UPDATE commands
             SET status = 'pending', leased_by = NULL, lease_at = NULL, lease_expires_at = NULL
             WHERE status = 'leased' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?",
        );
        if agent_id.is_some() {
            recycle.push_str(" AND agent_id = ?");
        }
        let mut q = sqlx::query(&recycle).bind(ts(now));
        if let Some(agent) = agent_id {
            q = q.bind(agent);
        }
        let recovered = q.execute(&mut **tx).await?.rows_affected();

        Ok(ReapSummary { recovered, failed })
    }
}

#[async_trait]
impl CommandStore for SqliteOutbox {
    async fn enqueue(&self, cmd: NewCommand, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        if cmd.agent_id.trim().is_empty() {
            return Err(OutboxError::Validation("agent_id is required".into()));
        }
        if cmd.kind.trim().is_empty() {
            return Err(OutboxError::Validation("kind is required".into()));
        }
        let hash = intent_hash(&cmd.kind, &cmd.payload);

        let mut tx = self.pool.begin().await?;
        if let Some(key) = cmd.dedupe_key.as_deref() {
            if let Some(id) = Self::find_live_by_dedupe(&mut tx, &cmd.agent_id, key).await? {
                tx.rollback().await?;
                return Ok(EnqueueOutcome::Duplicate {
                    id,
                    intent_hash: hash,
                });
            }
        }
        if let Some(id) = Self::find_live_by_intent(&mut tx, &cmd.agent_id, &hash).await? {
            tx.rollback().await?;
            return Ok(EnqueueOutcome::Duplicate {
                id,
                intent_hash: hash,
            });
        }

        let payload = serde_json::to_string(&cmd.payload)?;
        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO commands
                 (created_at, agent_id, kind, payload, not_before, dedupe_key, intent_hash, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending')
             RETURNING id",
        )
        .bind(ts(now))
        .bind(&cmd.agent_id)
        .bind(&cmd.kind)
        .bind(&payload)
        .bind(cmd.not_before.map(ts))
        .bind(&cmd.dedupe_key)
        .bind(&hash)
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok(id) => {
                tx.commit().await?;
                Ok(EnqueueOutcome::Created {
                    id,
                    intent_hash: hash,
                })
            }
            Err(e) => {
                tx.rollback().await?;
                let err = OutboxError::from(e);
                if err.is_unique_violation() {
                    // Lost a dedupe race; the surviving live row is the duplicate.
                    let mut tx = self.pool.begin().await?;
                    let existing = match cmd.dedupe_key.as_deref() {
                        Some(key) => {
                            Self::find_live_by_dedupe(&mut tx, &cmd.agent_id, key).await?
                        }
                        None => None,
                    };
                    let existing = match existing {
                        Some(id) => Some(id),
                        None => Self::find_live_by_intent(&mut tx, &cmd.agent_id, &hash).await?,
                    };
                    tx.rollback().await?;
                    let id = existing.ok_or(err)?;
                    Ok(EnqueueOutcome::Duplicate {
                        id,
                        intent_hash: hash,
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn pull(
        &self,
        agent_id: &str,
        limit: u32,
        lease_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedCommand>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;

        // Expired leases for this agent become visible to the same pull.
        self.reap_in_tx(&mut tx, Some(agent_id), now).await?;

        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM commands
             WHERE agent_id = ? AND status = 'pending'
               AND (not_before IS NULL OR not_before <= ?)
             ORDER BY id ASC
             LIMIT ?",
        )
        .bind(agent_id)
        .bind(ts(now))
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let lease_update = format!(
            "UPDATE commands
             SET status = 'leased', leased_by = ?, lease_at = ?, lease_expires_at = ?,
                 attempts = attempts + 1
             WHERE status = 'pending' AND id IN ({placeholders})"
        );
        let mut q = sqlx::query(&lease_update)
            .bind(agent_id)
            .bind(ts(now))
            .bind(ts(now) + lease_secs.max(1));
        for id in &ids {
            q = q.bind(id);
        }
        q.execute(&mut *tx).await?;

        let select = format!(
            "SELECT id, kind, payload, attempts FROM commands
             WHERE id IN ({placeholders})
             ORDER BY id ASC"
        );
        let mut q = sqlx::query(&select);
        for id in &ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&mut *tx).await?;
        tx.commit().await?;

        rows.iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                Ok(LeasedCommand {
                    id: row.try_get("id")?,
                    kind: row.try_get("kind")?,
                    payload: serde_json::from_str(&payload)?,
                    attempts: row.try_get("attempts")?,
                })
            })
            .collect()
    }

    async fn ack(&self, report: AckReport, now: DateTime<Utc>) -> Result<AckOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status, leased_by FROM commands WHERE id = ?")
            .bind(report.cmd_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(AckOutcome::Rejected(AckRejection::NotFound));
        };
        let status: String = row.try_get("status")?;
        let status = CommandStatus::parse(&status)?;
        let leased_by: Option<String> = row.try_get("leased_by")?;

        if status.is_terminal() {
            tx.rollback().await?;
            return Ok(AckOutcome::AlreadyAcked);
        }
        if status == CommandStatus::Pending {
            tx.rollback().await?;
            return Ok(AckOutcome::Rejected(AckRejection::NotLeased));
        }
        if leased_by.as_deref() != Some(report.agent_id.as_str()) {
            tx.rollback().await?;
            return Ok(AckOutcome::Rejected(AckRejection::WrongOwner));
        }

        let result = serde_json::to_string(&report.result)?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO receipts
                 (cmd_id, agent_id, ok, status, txid, message, received_at, result)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(report.cmd_id)
        .bind(&report.agent_id)
        .bind(report.ok)
        .bind(&report.status)
        .bind(&report.txid)
        .bind(&report.message)
        .bind(ts(now))
        .bind(&result)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(AckOutcome::AlreadyAcked);
        }

        let terminal = if report.ok {
            CommandStatus::Done
        } else {
            CommandStatus::Error
        };
        sqlx::query(
            "UPDATE commands
             SET status = ?, leased_by = NULL, lease_at = NULL, lease_expires_at = NULL
             WHERE id = ?",
        )
        .bind(terminal.as_str())
        .bind(report.cmd_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(AckOutcome::Applied { status: terminal })
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapSummary> {
        let mut tx = self.pool.begin().await?;
        let summary = self.reap_in_tx(&mut tx, None, now).await?;
        tx.commit().await?;
        Ok(summary)
    }

    async fn get_command(&self, id: i64) -> Result<Option<Command>> {
        let sql = format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(command_from_row).transpose()
    }

    async fn get_receipt(&self, cmd_id: i64) -> Result<Option<Receipt>> {
        let row = sqlx::query(
            "SELECT id, cmd_id, agent_id, ok, status, txid, message, received_at, result
             FROM receipts WHERE cmd_id = ?",
        )
        .bind(cmd_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let result: String = row.try_get("result")?;
        Ok(Some(Receipt {
            id: row.try_get("id")?,
            cmd_id: row.try_get("cmd_id")?,
            agent_id: row.try_get("agent_id")?,
            ok: row.try_get("ok")?,
            status: row.try_get("status")?,
            txid: row.try_get("txid")?,
            message: row.try_get("message")?,
            received_at: from_ts(row.try_get("received_at")?)?,
            result: serde_json::from_str(&result)?,
        }))
    }

    async fn list_commands(&self, filter: CommandFilter, limit: u32) -> Result<Vec<Command>> {
        let mut sql = format!("SELECT {COMMAND_COLUMNS} FROM commands");
        let mut conds = Vec::new();
        if filter.agent_id.is_some() {
            conds.push("agent_id = ?");
        }
        if filter.status.is_some() {
            conds.push("status = ?");
        }
        if !conds.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conds.join(" AND "));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut q = sqlx::query(&sql);
        if let Some(agent) = &filter.agent_id {
            q = q.bind(agent);
        }
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }
        q = q.bind(i64::from(limit.max(1)));

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(command_from_row).collect()
    }

    async fn status_counts(&self, filter: CommandFilter) -> Result<Vec<(String, i64)>> {
        let rows = match &filter.agent_id {
            Some(agent) => {
                sqlx::query(
                    "SELECT status, COUNT(*) AS n FROM commands
                     WHERE agent_id = ? GROUP BY status ORDER BY status",
                )
                .bind(agent)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT status, COUNT(*) AS n FROM commands GROUP BY status ORDER BY status",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter()
            .map(|row| Ok((row.try_get("status")?, row.try_get("n")?)))
            .collect()
    }

    async fn force_release(&self, id: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE commands
             SET status = 'pending', leased_by = NULL, lease_at = NULL, lease_expires_at = NULL
             WHERE id = ? AND status = 'leased'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteOutbox {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::sqlite_migrator()
            .run(&pool)
            .await
            .unwrap();
        SqliteOutbox::new(pool, 5)
    }

    fn cmd(agent: &str, payload: serde_json::Value) -> NewCommand {
        NewCommand {
            agent_id: agent.to_string(),
            kind: "order.place".to_string(),
            payload,
            not_before: None,
            dedupe_key: None,
        }
    }

    #[tokio::test]
    async fn enqueue_then_pull_leases_fifo() {
        let s = store().await;
        let now = Utc::now();
        let a = s.enqueue(cmd("edge-1", json!({"n": 1})), now).await.unwrap();
        let b = s.enqueue(cmd("edge-1", json!({"n": 2})), now).await.unwrap();
        assert!(a.id() < b.id());

        let leased = s.pull("edge-1", 10, 45, now).await.unwrap();
        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0].id, a.id());
        assert_eq!(leased[1].id, b.id());
        assert_eq!(leased[0].attempts, 1);
    }

    #[tokio::test]
    async fn dedupe_key_collapses_enqueues() {
        let s = store().await;
        let now = Utc::now();
        let mut first = cmd("edge-1", json!({"n": 1}));
        first.dedupe_key = Some("rebalance-2026-08".to_string());
        let mut second = cmd("edge-1", json!({"n": 2}));
        second.dedupe_key = Some("rebalance-2026-08".to_string());

        let a = s.enqueue(first, now).await.unwrap();
        let b = s.enqueue(second, now).await.unwrap();
        assert!(!a.is_duplicate());
        assert!(b.is_duplicate());
        assert_eq!(a.id(), b.id());
    }

    #[tokio::test]
    async fn not_before_defers_delivery() {
        let s = store().await;
        let now = Utc::now();
        let mut c = cmd("edge-1", json!({"n": 1}));
        c.not_before = Some(now + Duration::seconds(60));
        s.enqueue(c, now).await.unwrap();

        assert!(s.pull("edge-1", 10, 45, now).await.unwrap().is_empty());
        let later = now + Duration::seconds(61);
        assert_eq!(s.pull("edge-1", 10, 45, later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn force_release_only_touches_leased_rows() {
        let s = store().await;
        let now = Utc::now();
        let id = s.enqueue(cmd("edge-1", json!({"n": 1})), now).await.unwrap().id();
        assert!(!s.force_release(id).await.unwrap());

        s.pull("edge-1", 1, 45, now).await.unwrap();
        assert!(s.force_release(id).await.unwrap());

        let again = s.pull("edge-1", 1, 45, now).await.unwrap();
        assert_eq!(again[0].id, id);
        assert_eq!(again[0].attempts, 2);
    }
}
