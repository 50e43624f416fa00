//! Storage trait definitions.
//!
//! Both backends implement the same contracts; every timestamp-sensitive
//! operation takes `now` from the caller so lease expiry can be tested
//! without sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;

use crate::domain::{
    AckOutcome, AckReport, AgentAuthority, AuthorityTouch, Command, CommandFilter, EnqueueOutcome,
    LeasedCommand, NewCommand, ReapSummary, Receipt,
};
use crate::infra::error::Result;

/// Durable command outbox: enqueue, lease-based delivery, exactly-once
/// acknowledgement and expired-lease recovery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert a command, or resolve to the live duplicate that already
    /// carries the same dedupe key or intent hash for this agent.
    async fn enqueue(&self, cmd: NewCommand, now: DateTime<Utc>) -> Result<EnqueueOutcome>;

    /// Atomically lease up to `limit` eligible commands for `agent_id`,
    /// oldest first. Leasing increments the attempt counter.
    async fn pull(
        &self,
        agent_id: &str,
        limit: u32,
        lease_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeasedCommand>>;

    /// Record an execution receipt and flip the command terminal, in one
    /// transaction. Retries of an already-acked command are absorbed.
    async fn ack(&self, report: AckReport, now: DateTime<Utc>) -> Result<AckOutcome>;

    /// Recycle expired leases to pending, retiring commands that have
    /// exhausted their attempts to error with a synthetic receipt.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapSummary>;

    /// Fetch one command by id.
    async fn get_command(&self, id: i64) -> Result<Option<Command>>;

    /// Fetch the receipt recorded for a command, if any.
    async fn get_receipt(&self, cmd_id: i64) -> Result<Option<Receipt>>;

    /// List commands for inspection, newest first.
    async fn list_commands(&self, filter: CommandFilter, limit: u32) -> Result<Vec<Command>>;

    /// Count commands grouped by status, optionally for one agent.
    async fn status_counts(&self, filter: CommandFilter) -> Result<Vec<(String, i64)>>;

    /// Operator override: return one leased command to pending without
    /// waiting for its lease to expire. Terminal rows are left alone.
    async fn force_release(&self, id: i64) -> Result<bool>;
}

/// Persisted per-agent trust records backing the authority gate.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthorityStore: Send + Sync {
    /// Record a contact from `agent_id`, inserting the row on first sight
    /// with `default_trusted`. Returns the record together with the
    /// `last_seen` it held before this touch.
    async fn touch_agent(
        &self,
        agent_id: &str,
        default_trusted: bool,
        now: DateTime<Utc>,
    ) -> Result<AuthorityTouch>;

    /// Operator kill switch: set the trust flag and reason for an agent,
    /// creating the row if the agent has never connected.
    async fn set_trust(
        &self,
        agent_id: &str,
        trusted: bool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// All known agents, for inspection.
    async fn list_agents(&self) -> Result<Vec<AgentAuthority>>;
}
