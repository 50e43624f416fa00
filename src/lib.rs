//! Edgebus: durable command outbox and lease-based delivery bus.
//!
//! A trading bus enqueues commands for remote execution agents; agents
//! poll over HTTPS, lease batches, execute, and acknowledge. Durability
//! and idempotency live in the store: duplicate intents collapse at
//! enqueue, every command is leased to at most one agent at a time, and
//! crashed agents lose nothing because expired leases recycle back to
//! pending until the attempt cap retires them.
//!
//! Two interchangeable backends implement the same contract: PostgreSQL
//! (`FOR UPDATE SKIP LOCKED`) for multi-node deployments and SQLite
//! (single writer) for single-node ones.

pub mod api;
pub mod auth;
pub mod crypto;
pub mod domain;
pub mod infra;
pub mod migrations;
pub mod server;

pub use domain::{
    AckOutcome, AckRejection, AckReport, AgentAuthority, Command, CommandFilter, CommandStatus,
    EnqueueOutcome, LeasedCommand, NewCommand, ReapSummary, Receipt,
};
pub use infra::{
    AuthorityStore, CommandStore, OutboxError, PgAuthority, PgOutbox, Reaper, Result,
    SqliteAuthority, SqliteOutbox,
};
