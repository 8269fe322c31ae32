//! Error types for the catalog state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
///
/// Absent rows are not errors: reads return `None` or an empty collection
/// and deletes of missing rows succeed without effect.
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

    /// The write referenced a node that is not registered.
    #[error("missing node registration")]
    MissingNode,

    /// The check referenced a service that is not registered on its node.
    #[error("missing service registration")]
    MissingService,

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
