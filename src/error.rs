//! Error types for air4-memory

use thiserror::Error;

/// Result type alias for air4-memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in air4-memory
///
/// Only configuration-level failures are meant to be fatal. `StoreUnavailable`,
/// `QueryFailed` and `MalformedSummary` are recovered inside the crate and are
/// exposed so callers can log or test the degraded paths.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Embedding model unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Vector store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Malformed summary: {0}")]
    MalformedSummary(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector database error: {0}")]
    VectorDb(String),

    #[error("Completion service error: {0}")]
    Completion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn embedding_unavailable(msg: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn query_failed(msg: impl Into<String>) -> Self {
        Self::QueryFailed(msg.into())
    }

    pub fn malformed_summary(msg: impl Into<String>) -> Self {
        Self::MalformedSummary(msg.into())
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    pub fn vector_db(msg: impl Into<String>) -> Self {
        Self::VectorDb(msg.into())
    }

    pub fn completion(msg: impl Into<String>) -> Self {
        Self::Completion(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error comes from an external dependency (model, store,
    /// completion service) rather than from the caller or the configuration.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::QueryFailed(_)
                | Error::MalformedSummary(_)
                | Error::Embedding(_)
                | Error::VectorDb(_)
                | Error::Completion(_)
        )
    }
}
