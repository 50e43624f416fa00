//! Domain models for the command outbox
//!
//! Core types for durable commands, lease delivery, execution receipts
//! and agent trust records.

mod command;

pub use command::*;
