//! Error types for the hive state store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Failures of the persistence layer. Values are stored as JSON, so
/// (de)serialization problems surface here as well.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
