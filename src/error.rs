//! Error types for condition compilation, relation resolution and query execution

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while compiling, rewriting or executing a query
#[derive(Debug, Error)]
pub enum QueryError {
    /// Metadata is inconsistent (missing link target, unknown reverse field, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Field '{field}' not found on object '{object}'")]
    FieldNotFound { object: String, field: String },

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Caller input has the wrong shape (not a JSON object, bad shorthand, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The condition tree cannot be compiled; carries the offending fragment
    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    /// Scope resolution failed; the request must be rejected
    #[error("Security error: {0}")]
    Security(String),

    #[error("SQL error: {source} (sql: {sql})")]
    Sql {
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueryError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn object_not_found(msg: impl Into<String>) -> Self {
        Self::ObjectNotFound(msg.into())
    }

    pub fn field_not_found(object: impl Into<String>, field: impl Into<String>) -> Self {
        Self::FieldNotFound {
            object: object.into(),
            field: field.into(),
        }
    }

    pub fn record_not_found(msg: impl Into<String>) -> Self {
        Self::RecordNotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn invalid_condition(msg: impl Into<String>) -> Self {
        Self::InvalidCondition(msg.into())
    }

    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    /// Attach the statement that triggered a driver error
    pub fn sql(sql: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Sql {
            sql: sql.into(),
            source,
        }
    }

    /// Whether the error belongs to the connection reset / timeout class.
    ///
    /// Only reads are re-issued on a transient error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sql { source, .. } => match source {
                sqlx::Error::PoolTimedOut => true,
                sqlx::Error::Io(io) => matches!(
                    io.kind(),
                    std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::UnexpectedEof
                ),
                _ => false,
            },
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

/// A caller-facing validation failure for a single field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Column name of the offending field
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}
