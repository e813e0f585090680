//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown feeder kind: {0}")]
    UnknownFeeder(String),

    #[error("No active feeder of kind {0}")]
    NoActiveFeeder(String),

    #[error("Controller is shutting down")]
    NotRunning,

    #[error("Process id space exhausted ({capacity} ids in use)")]
    IdSpaceExhausted { capacity: usize },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Unrecoverable worker error: the worker terminates itself.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Per-item error: the worker logs it and moves on to the next item.
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Interrupted while processing")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Whether a worker must stop after seeing this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
