//! Error types for the collector

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Management API unavailable or returned garbage
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Datastore rejected a read or write
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reqwest HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for collector operations
pub type Result<T> = std::result::Result<T, Error>;
