//! Error types for the memory filter pipeline

use std::time::Duration;
use thiserror::Error;

/// Result type alias for filter operations
pub type Result<T> = std::result::Result<T, FilterError>;

#[derive(Error, Debug)]
pub enum FilterError {

    // =============================
    // Configuration
    // =============================

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =============================
    // Memory Store Errors
    // =============================

    #[error("Memory store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Memory store write failed: {0}")]
    StoreWrite(String),

    #[error("Memory store search failed: {0}")]
    StoreSearch(String),

    #[error("Memory store call timed out after {0:?}")]
    Timeout(Duration),

    // =============================
    // Request Errors
    // =============================

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}
