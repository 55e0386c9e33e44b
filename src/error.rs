// src/error.rs

//! Unified error handling for the aggregation and archive jobs.

use std::fmt;

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Object storage request failed
    #[error("Object storage error: {0}")]
    ObjectStorage(String),

    /// Object storage has no usable credentials
    #[error("Object storage credentials not provided: {0}")]
    MissingCredentials(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite operation failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Referenced row does not exist
    #[error("{kind} '{id}' does not exist")]
    NotFound { kind: &'static str, id: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create an object storage error.
    pub fn object_storage(message: impl fmt::Display) -> Self {
        Self::ObjectStorage(message.to_string())
    }

    /// Create a missing-credentials error.
    pub fn missing_credentials(message: impl Into<String>) -> Self {
        Self::MissingCredentials(message.into())
    }

    /// Create a not-found error for a referenced row.
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether this error is a unique-constraint violation from SQLite.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}
