//! PostgreSQL implementations for multi-node deployments
//!
//! Lease claims rely on `FOR UPDATE SKIP LOCKED` so any number of bus
//! replicas can serve pulls against the same database.

mod authority;
mod outbox;

pub use authority::*;
pub use outbox::*;
