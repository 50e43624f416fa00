//! PostgreSQL agent authority store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::domain::{AgentAuthority, AuthorityTouch};
use crate::infra::error::Result;
use crate::infra::traits::AuthorityStore;

pub struct PgAuthority {
    pool: PgPool,
}

impl PgAuthority {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthorityStore for PgAuthority {
    async fn touch_agent(
        &self,
        agent_id: &str,
        default_trusted: bool,
        now: DateTime<Utc>,
    ) -> Result<AuthorityTouch> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT trusted, reason, last_seen, created_at
             FROM agent_authority WHERE agent_id = $1 FOR UPDATE",
        )
        .bind(agent_id)
        .fetch_optional(&mut *tx)
        .await?;

        let touch = match existing {
            Some(row) => {
                let prior: DateTime<Utc> = row.try_get("last_seen")?;
                sqlx::query(
                    "UPDATE agent_authority SET last_seen = $1, updated_at = $1 WHERE agent_id = $2",
                )
                .bind(now)
                .bind(agent_id)
                .execute(&mut *tx)
                .await?;
                AuthorityTouch {
                    record: AgentAuthority {
                        agent_id: agent_id.to_string(),
                        trusted: row.try_get("trusted")?,
                        reason: row.try_get("reason")?,
                        last_seen: now,
                        created_at: row.try_get("created_at")?,
                    },
                    prior_last_seen: Some(prior),
                }
            }
            None => {
                sqlx::query(
                    "INSERT INTO agent_authority
                         (agent_id, trusted, reason, last_seen, created_at, updated_at)
                     VALUES ($1, $2, '', $3, $3, $3)
                     ON CONFLICT (agent_id) DO UPDATE SET last_seen = $3, updated_at = $3",
                )
                .bind(agent_id)
                .bind(default_trusted)
                .bind(now)
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
             VALUES ($1, $2, $3, $4, $4, $4)
             ON CONFLICT (agent_id) DO UPDATE
             SET trusted = EXCLUDED.trusted, reason = EXCLUDED.reason,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(agent_id)
        .bind(trusted)
        .bind(reason)
        .bind(now)
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
                    last_seen: row.try_get("last_seen")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
