//! Cryptographic utilities for the command outbox
//!
//! Canonical JSON hashing (deterministic, cross-language compatible)
//! used to derive intent hashes for idempotent enqueue.

mod hash;

pub use hash::*;
