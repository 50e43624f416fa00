//! HTTP API for the command bus
//!
//! REST endpoints for agent pull/ack and operator enqueue.

mod rest;

pub use rest::*;
