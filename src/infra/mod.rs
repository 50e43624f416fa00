//! Infrastructure layer for the command outbox
//!
//! Contains trait definitions and implementations for:
//! - Command storage (PostgreSQL, SQLite)
//! - Agent authority records
//! - Background lease reaping

pub mod error;
pub mod postgres;
mod reaper;
pub mod sqlite;
pub mod traits;

pub use error::*;
pub use postgres::{PgAuthority, PgOutbox};
pub use reaper::Reaper;
pub use sqlite::{SqliteAuthority, SqliteOutbox};
pub use traits::*;
