//! PostgreSQL command store.
//!
//! Lease claims use `FOR UPDATE SKIP LOCKED` so concurrent pulls for the
//! same agent contend on rows, not on each other: two racing pulls split
//! the eligible set instead of double-leasing any command.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::crypto::intent_hash;
use crate::domain::{
    AckOutcome, AckRejection, AckReport, Command, CommandFilter, CommandStatus, EnqueueOutcome,
    LeasedCommand, NewCommand, ReapSummary, Receipt,
};
use crate::infra::error::{OutboxError, Result};
use crate::infra::traits::CommandStore;

/// Postgres-backed outbox for multi-node deployments.
pub struct PgOutbox {
    pool: PgPool,
    max_attempts: i32,
}

fn command_from_row(row: &PgRow) -> Result<Command> {
    let status: String = row.try_get("status")?;
    Ok(Command {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        agent_id: row.try_get("agent_id")?,
        kind: row.try_get("kind")?,
        payload: row.try_get("payload")?,
        not_before: row.try_get("not_before")?,
        dedupe_key: row.try_get("dedupe_key")?,
        intent_hash: row.try_get("intent_hash")?,
        status: CommandStatus::parse(&status)?,
        leased_by: row.try_get("leased_by")?,
        lease_at: row.try_get("lease_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        attempts: row.try_get("attempts")?,
    })
}

const COMMAND_COLUMNS: &str = "id, created_at, agent_id, kind, payload, not_before, dedupe_key, \
     intent_hash, status, leased_by, lease_at, lease_expires_at, attempts";

impl PgOutbox {
    pub fn new(pool: PgPool, max_attempts: u32) -> Self {
        Self {
            pool,
            max_attempts: max_attempts.max(1) as i32,
        }
    }

    async fn find_live_by_dedupe(
        tx: &mut Transaction<'_, Postgres>,
        agent_id: &str,
        key: &str,
    ) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM commands
             WHERE agent_id = $1 AND dedupe_key = $2 AND status IN ('pending', 'leased')
             LIMIT 1",
        )
        .bind(agent_id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(id)
    }

    async fn find_live_by_intent(
        tx: &mut Transaction<'_, Postgres>,
        agent_id: &str,
        hash: &str,
    ) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM commands
             WHERE agent_id = $1 AND intent_hash = $2 AND status IN ('pending', 'leased')
             LIMIT 1",
        )
        .bind(agent_id)
        .bind(hash)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(id)
    }

    /// Shared reap pass. Over-cap leases are locked, retired to error with
    /// a synthetic receipt, then the recycle sweep returns the rest to
    /// pending. Rows locked by a concurrent pass are skipped and handled
    /// on the next tick.
    async fn reap_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReapSummary> {
        let exhausted = sqlx::query(
            "SELECT id, agent_id FROM commands
             WHERE status = 'leased' AND lease_expires_at IS NOT NULL
               AND lease_expires_at <= $1 AND attempts >= $2
               AND ($3::text IS NULL OR agent_id = $3)
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .bind(self.max_attempts)
        .bind(agent_id)
        .fetch_all(&mut **tx)
        .await?;

        let mut failed = 0u64;
        for row in &exhausted {
            let id: i64 = row.try_get("id")?;
            let owner: String = row.try_get("agent_id")?;
            sqlx::query(
                "INSERT INTO receipts
                     (cmd_id, agent_id, ok, status, message, received_at, result)
                 VALUES ($1, $2, FALSE, 'error', 'max_attempts_exceeded', $3, $4)
                 ON CONFLICT (cmd_id) DO NOTHING",
            )
            .bind(id)
            .bind(&owner)
            .bind(now)
            .bind(serde_json::json!({"reason": "max_attempts_exceeded"}))
            .execute(&mut **tx)
            .await?;
            sqlx::query(
                "UPDATE commands
                 SET status = 'error', leased_by = NULL, lease_at = NULL, lease_expires_at = NULL
                 WHERE id = $1 AND status = 'leased'",
            )
            .bind(id)
            .execute(&mut **tx)
            .await?;
            failed += 1;
        }

        let recovered = sqlx::query(
            "WITH expired AS (
                 SELECT id FROM commands
                 WHERE status = 'leased' AND lease_expires_at IS NOT NULL
                   AND lease_expires_at <= $1 AND attempts < $2
                   AND ($3::text IS NULL OR agent_id = $3)
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE commands c
             SET status = 'pending', leased_by = NULL, lease_at = NULL, lease_expires_at = NULL
             FROM expired WHERE c.id = expired.id",
        )
        .bind(now)
        .bind(self.max_attempts)
        .bind(agent_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        Ok(ReapSummary { recovered, failed })
    }
}

#[async_trait]
impl CommandStore for PgOutbox {
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

        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO commands
                 (created_at, agent_id, kind, payload, not_before, dedupe_key, intent_hash, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
             RETURNING id",
        )
        .bind(now)
        .bind(&cmd.agent_id)
        .bind(&cmd.kind)
        .bind(&cmd.payload)
        .bind(cmd.not_before)
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

        let rows = sqlx::query(
            "WITH claimed AS (
                 SELECT id FROM commands
                 WHERE agent_id = $1 AND status = 'pending'
                   AND (not_before IS NULL OR not_before <= $2)
                 ORDER BY id ASC
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE commands c
             SET status = 'leased', leased_by = $1, lease_at = $2, lease_expires_at = $4,
                 attempts = c.attempts + 1
             FROM claimed WHERE c.id = claimed.id
             RETURNING c.id, c.kind, c.payload, c.attempts",
        )
        .bind(agent_id)
        .bind(now)
        .bind(i64::from(limit))
        .bind(now + chrono::Duration::seconds(lease_secs.max(1)))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut leased = rows
            .iter()
            .map(|row| {
                Ok(LeasedCommand {
                    id: row.try_get("id")?,
                    kind: row.try_get("kind")?,
                    payload: row.try_get("payload")?,
                    attempts: row.try_get("attempts")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        // UPDATE ... RETURNING does not guarantee order.
        leased.sort_by_key(|c| c.id);
        Ok(leased)
    }

    async fn ack(&self, report: AckReport, now: DateTime<Utc>) -> Result<AckOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status, leased_by FROM commands WHERE id = $1 FOR UPDATE")
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

        let inserted = sqlx::query(
            "INSERT INTO receipts
                 (cmd_id, agent_id, ok, status, txid, message, received_at, result)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (cmd_id) DO NOTHING",
        )
        .bind(report.cmd_id)
        .bind(&report.agent_id)
        .bind(report.ok)
        .bind(&report.status)
        .bind(&report.txid)
        .bind(&report.message)
        .bind(now)
        .bind(&report.result)
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
             SET status = $1, leased_by = NULL, lease_at = NULL, lease_expires_at = NULL
             WHERE id = $2",
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
        let sql = format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(command_from_row).transpose()
    }

    async fn get_receipt(&self, cmd_id: i64) -> Result<Option<Receipt>> {
        let row = sqlx::query(
            "SELECT id, cmd_id, agent_id, ok, status, txid, message, received_at, result
             FROM receipts WHERE cmd_id = $1",
        )
        .bind(cmd_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let result: Value = row.try_get("result")?;
        Ok(Some(Receipt {
            id: row.try_get("id")?,
            cmd_id: row.try_get("cmd_id")?,
            agent_id: row.try_get("agent_id")?,
            ok: row.try_get("ok")?,
            status: row.try_get("status")?,
            txid: row.try_get("txid")?,
            message: row.try_get("message")?,
            received_at: row.try_get("received_at")?,
            result,
        }))
    }

    async fn list_commands(&self, filter: CommandFilter, limit: u32) -> Result<Vec<Command>> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM commands
             WHERE ($1::text IS NULL OR agent_id = $1)
               AND ($2::text IS NULL OR status = $2)
             ORDER BY id DESC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(&filter.agent_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(i64::from(limit.max(1)))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(command_from_row).collect()
    }

    async fn status_counts(&self, filter: CommandFilter) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM commands
             WHERE ($1::text IS NULL OR agent_id = $1)
             GROUP BY status ORDER BY status",
        )
        .bind(&filter.agent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("status")?, row.try_get("n")?)))
            .collect()
    }

    async fn force_release(&self, id: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE commands
             SET status = 'pending', leased_by = NULL, lease_at = NULL, lease_expires_at = NULL
             WHERE id = $1 AND status = 'leased'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}
