//! Authentication and authorization for the command bus
//!
//! Two independent gates protect delivery:
//!
//! - **HMAC**: shared-secret signatures over raw request bodies prove a
//!   caller holds the bus secret. Unconfigured secrets reject by default;
//!   the unsigned bypass is an explicit, loudly logged dev switch.
//! - **Agent authority**: persisted per-agent trust records let operators
//!   cut off a compromised agent without touching its queued commands.
//!   Untrusted agents get an empty held response, not a transport error.

mod authority;
mod hmac;

pub use authority::*;
pub use hmac::*;
