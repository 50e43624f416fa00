//! Error types for the outbox infrastructure layer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OutboxError>;

impl OutboxError {
    /// True when the underlying driver reported a unique constraint
    /// violation, which the enqueue path treats as a lost dedupe race.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            OutboxError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}
