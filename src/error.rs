//! Error types for framl-core.

use thiserror::Error;

/// Result type alias using framl-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during fraud analysis.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed transaction fields; surfaced before analysis starts
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transient upstream failure (document store, embedding, reasoner); retryable
    #[error("Transient upstream error: {component} - {message}")]
    UpstreamTransient { component: String, message: String },

    /// Non-retryable upstream failure; the component degrades to unknown/empty
    #[error("Permanent upstream error: {component} - {message}")]
    UpstreamPermanent { component: String, message: String },

    /// Stage budget exceeded
    #[error("Stage {stage} timed out after {budget_ms}ms")]
    Timeout { stage: u8, budget_ms: u64 },

    /// Embedding dimension mismatch with the vector index
    #[error("Index dimension skew: index expects {expected}, got {actual}")]
    IndexSkew { expected: usize, actual: usize },

    /// History store error
    #[error("History store error: {0}")]
    Storage(String),

    /// Reasoner protocol error
    #[error("Reasoner error: {0}")]
    Reasoner(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Programmer error; fails the analysis
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a transient upstream error.
    pub fn transient(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamTransient {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a permanent upstream error.
    pub fn permanent(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamPermanent {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a stage timeout error.
    pub fn timeout(stage: u8, budget_ms: u64) -> Self {
        Self::Timeout { stage, budget_ms }
    }

    /// Create an index skew error.
    pub fn index_skew(expected: usize, actual: usize) -> Self {
        Self::IndexSkew { expected, actual }
    }

    /// Whether a bounded retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpstreamTransient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("embedding", "503").is_transient());
        assert!(!Error::permanent("embedding", "401").is_transient());
        assert!(!Error::timeout(2, 60_000).is_transient());
        assert!(!Error::invalid_input("missing txn_id").is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::timeout(1, 150);
        assert_eq!(err.to_string(), "Stage 1 timed out after 150ms");

        let err = Error::index_skew(384, 768);
        assert!(err.to_string().contains("384"));
        assert!(err.to_string().contains("768"));
    }
}
