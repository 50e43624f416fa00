//! SQLite implementations for single-node deployments
//!
//! The pool is expected to be built with `max_connections(1)`; the store
//! relies on single-writer discipline in place of row locking.

mod authority;
mod outbox;

pub use authority::*;
pub use outbox::*;
