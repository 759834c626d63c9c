// src/core/errors.rs

//! Failure modes of the controller. None of them is fatal: the reconciler
//! logs and continues per key, and the tick boundary swallows the rest.

use thiserror::Error;

/// Everything that can go wrong while reconciling: the shared database, the
/// cache payloads, or the cached keys themselves.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueFillError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache payload error: {0}")]
    CachePayload(String),

    #[error("Unsupported cache schema version {0}")]
    CacheSchemaVersion(u32),

    #[error("Malformed preassignment key '{0}'")]
    MalformedKey(String),

    #[error("Lock error: {0}")]
    Locking(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// sqlx::Error is not Clone, so it is flattened to its message here.
impl From<sqlx::Error> for QueueFillError {
    fn from(e: sqlx::Error) -> Self {
        QueueFillError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for QueueFillError {
    fn from(e: serde_json::Error) -> Self {
        QueueFillError::CachePayload(format!("JSON serialization/deserialization error: {e}"))
    }
}
