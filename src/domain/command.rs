//! Core outbox types: commands, receipts, acknowledgement reports and the
//! outcomes the store hands back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::infra::error::{OutboxError, Result};

// ===== Command Status =====

/// Lifecycle state of a command row.
///
/// `Pending` and `Leased` are live states; `Done` and `Error` are terminal
/// and never mutate again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Leased,
    Done,
    Error,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Leased => "leased",
            CommandStatus::Done => "done",
            CommandStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "leased" => Ok(CommandStatus::Leased),
            "done" => Ok(CommandStatus::Done),
            "error" => Ok(CommandStatus::Error),
            other => Err(OutboxError::Internal(format!(
                "unknown command status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Done | CommandStatus::Error)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ===== Commands =====

/// A fully materialized command row, as stored.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub agent_id: String,
    pub kind: String,
    pub payload: Value,
    pub not_before: Option<DateTime<Utc>>,
    pub dedupe_key: Option<String>,
    pub intent_hash: String,
    pub status: CommandStatus,
    pub leased_by: Option<String>,
    pub lease_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: i32,
}

/// Input for enqueueing a new command. The intent hash is computed by the
/// store, never supplied by callers.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub agent_id: String,
    pub kind: String,
    pub payload: Value,
    pub not_before: Option<DateTime<Utc>>,
    pub dedupe_key: Option<String>,
}

/// Result of an enqueue. A duplicate is a success: the caller learns the id
/// of the live command that already carries this intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created { id: i64, intent_hash: String },
    Duplicate { id: i64, intent_hash: String },
}

impl EnqueueOutcome {
    pub fn id(&self) -> i64 {
        match self {
            EnqueueOutcome::Created { id, .. } => *id,
            EnqueueOutcome::Duplicate { id, .. } => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate { .. })
    }
}

/// The slice of a command an agent sees when it wins a lease.
#[derive(Debug, Clone, Serialize)]
pub struct LeasedCommand {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    #[serde(skip)]
    pub attempts: i32,
}

// ===== Acknowledgements =====

/// An agent's execution report for one leased command.
#[derive(Debug, Clone)]
pub struct AckReport {
    pub agent_id: String,
    pub cmd_id: i64,
    pub ok: bool,
    pub status: Option<String>,
    pub txid: Option<String>,
    pub message: Option<String>,
    pub result: Value,
}

/// Why an acknowledgement was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRejection {
    NotFound,
    NotLeased,
    WrongOwner,
}

impl AckRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            AckRejection::NotFound => "not_found",
            AckRejection::NotLeased => "not_leased",
            AckRejection::WrongOwner => "wrong_owner",
        }
    }
}

/// Result of an acknowledgement attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Receipt recorded and the command flipped to its terminal status.
    Applied { status: CommandStatus },
    /// A receipt already exists; the retry is absorbed without effect.
    AlreadyAcked,
    Rejected(AckRejection),
}

/// A recorded acknowledgement. At most one exists per command.
#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub id: i64,
    pub cmd_id: i64,
    pub agent_id: String,
    pub ok: bool,
    pub status: Option<String>,
    pub txid: Option<String>,
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub result: Value,
}

// ===== Reaper =====

/// Outcome of one reap pass over expired leases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapSummary {
    /// Expired leases recycled back to pending.
    pub recovered: u64,
    /// Expired leases retired to error after exhausting their attempts.
    pub failed: u64,
}

impl ReapSummary {
    pub fn is_empty(&self) -> bool {
        self.recovered == 0 && self.failed == 0
    }
}

// ===== Agent Authority =====

/// Persisted trust record for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentAuthority {
    pub agent_id: String,
    pub trusted: bool,
    pub reason: String,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Result of touching an agent's authority row: the current record plus the
/// `last_seen` value it held before this contact, for age computation.
#[derive(Debug, Clone)]
pub struct AuthorityTouch {
    pub record: AgentAuthority,
    pub prior_last_seen: Option<DateTime<Utc>>,
}

/// Filter for admin listing of commands.
#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub agent_id: Option<String>,
    pub status: Option<CommandStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            CommandStatus::Pending,
            CommandStatus::Leased,
            CommandStatus::Done,
            CommandStatus::Error,
        ] {
            assert_eq!(CommandStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn unknown_status_is_an_error() {
        assert!(CommandStatus::parse("archived").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::Leased.is_terminal());
        assert!(CommandStatus::Done.is_terminal());
        assert!(CommandStatus::Error.is_terminal());
    }

    #[test]
    fn leased_command_wire_shape() {
        let cmd = LeasedCommand {
            id: 7,
            kind: "order.place".to_string(),
            payload: serde_json::json!({"venue": "KRAKEN"}),
            attempts: 2,
        };
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["type"], "order.place");
        assert!(v.get("attempts").is_none());
    }
}
