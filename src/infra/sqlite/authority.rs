//! SQLite agent authority store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::{AgentAuthority, AuthorityTouch};
use crate::infra::error::{OutboxError, Result};
use crate::infra::traits::AuthorityStore;

pub struct SqliteAuthority {
    pool: SqlitePool,
}

impl SqliteAuthority {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn from_ts(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| OutboxError::Internal(format!("timestamp out of range: {secs}")))
}

#[async_trait]
impl AuthorityStore for SqliteAuthority {
    async fn touch_agent(
        &self,
        agent_id: &str,
        default_trusted: bool,
        now: DateTime<Utc>,
    ) -> Result<AuthorityTouch> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT trusted, reason, last_seen, created_at FROM agent_authority WHERE agent_id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&mut *tx)
        .await?;

        let touch = match existing {
            Some(row) => {
                let prior: i64 = row.try_get("last_seen")?;
                sqlx::query(
                    "UPDATE agent_authority SET last_seen = ?, updated_at = ? WHERE agent_id = ?",
                )
                .bind(now.timestamp())
                .bind(now.timestamp())
                .bind(agent_id)
                .execute(&mut *tx)
                .await?;
                AuthorityTouch {
                    record: AgentAuthority {
                        agent_id: agent_id.to_string(),
                        trusted: row.try_get("trusted")?,
                        reason: row.try_get("reason")?,
                        last_seen: now,
                        created_at: from_ts(row.try_get("created_at")?)?,
                    },
                    prior_last_seen: Some(from_ts(prior)?),
                }
            }
            None => {
                sqlx::query(
                    "INSERT INTO agent_authority
                         (agent_id, trusted, reason, last_seen, created_at, updated_at)
                     VALUES (?, ?, '', ?, ?, ?)",
                )
                .bind(agent_id)
                .bind(default_trusted)
                .bind(now.timestamp())
                .bind(now.timestamp())
                .bind(now.timestamp())
                .execute(&mut *tx)
                .await?;
                AuthorityTouch {
                    record: AgentAuthority {
                        agent_id: agent_id.to_string(),
                        trusted: default_trusted,
                        reason: String::new(),
                        last_seen: now,
                        created_at: now,
                    },
                    prior_last_seen: None,
                }
            }
        };
        tx.commit().await?;
        Ok(touch)
    }

    async fn set_trust(
        &self,
        agent_id: &str,
        trusted: bool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_authority
                 (agent_id, trusted, reason, last_seen, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (agent_id) DO UPDATE
             SET trusted = excluded.trusted, reason = excluded.reason,
                 updated_at = excluded.updated_at",
        )
        .bind(agent_id)
        .bind(trusted)
        .bind(reason)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<AgentAuthority>> {
        let rows = sqlx::query(
            "SELECT agent_id, trusted, reason, last_seen, created_at
             FROM agent_authority ORDER BY agent_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(AgentAuthority {
                    agent_id: row.try_get("agent_id")?,
                    trusted: row.try_get("trusted")?,
                    reason: row.try_get("reason")?,
                    last_seen: from_ts(row.try_get("last_seen")?)?,
                    created_at: from_ts(row.try_get("created_at")?)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteAuthority {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::sqlite_migrator()
            .run(&pool)
            .await
            .unwrap();
        SqliteAuthority::new(pool)
    }

    #[tokio::test]
    async fn first_touch_inserts_with_default_trust() {
        let s = store().await;
        let now = Utc::now();
        let touch = s.touch_agent("edge-1", true, now).await.unwrap();
        assert!(touch.record.trusted);
        assert!(touch.prior_last_seen.is_none());
    }

    #[tokio::test]
    async fn repeat_touch_reports_prior_last_seen() {
        let s = store().await;
        let t0 = Utc::now();
        s.touch_agent("edge-1", true, t0).await.unwrap();
        let t1 = t0 + Duration::seconds(90);
        let touch = s.touch_agent("edge-1", true, t1).await.unwrap();
        assert_eq!(touch.prior_last_seen.unwrap().timestamp(), t0.timestamp());
        assert_eq!(touch.record.last_seen.timestamp(), t1.timestamp());
    }

    #[tokio::test]
    async fn set_trust_overrides_default_on_later_touch() {
        let s = store().await;
        let now = Utc::now();
        s.set_trust("edge-1", false, "incident-443", now).await.unwrap();
        let touch = s.touch_agent("edge-1", true, now).await.unwrap();
        assert!(!touch.record.trusted);
        assert_eq!(touch.record.reason, "incident-443");
    }
}
