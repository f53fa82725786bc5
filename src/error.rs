//! Crate-wide error taxonomy.
//!
//! Library code returns [`SemIndexError`]; the CLI maps variants onto exit
//! codes (config errors → 2, connection errors → 3, partial ingestion → 5).
//! Only the two transient kinds are ever retried; everything else surfaces
//! to the caller on first occurrence.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SemIndexError>;

/// Main error type.
#[derive(Error, Debug)]
pub enum SemIndexError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication rejected for {target}: {detail}")]
    Auth { target: String, detail: String },

    #[error("transient rate limit from {target}")]
    TransientRateLimit { target: String },

    #[error("transient network failure talking to {target}: {detail}")]
    TransientNetwork { target: String, detail: String },

    #[error("source '{source_name}' stalled after retries: {detail}")]
    SourceStalled { source_name: String, detail: String },

    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("conversion failed for {uri}: {detail}")]
    Conversion { uri: String, detail: String },

    #[error("chunking failed for {uri}: {detail}")]
    Chunking { uri: String, detail: String },

    #[error("model error: {0}")]
    Model(String),

    #[error("state store and vector store disagree on {document_id}: {detail}")]
    StateConsistency { document_id: String, detail: String },

    #[error("collection '{collection}' has vector size {actual}, configured {expected}")]
    VectorDimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl SemIndexError {
    /// Transient errors are the only ones the retry helpers re-attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SemIndexError::TransientRateLimit { .. } | SemIndexError::TransientNetwork { .. }
        )
    }

    /// Classify an HTTP status from a remote API the way the retry layer
    /// expects: 408/425/429/5xx are transient, 401/403 are auth, remaining
    /// 4xx are model errors.
    pub fn from_status(status: u16, target: &str, body: String) -> Self {
        match status {
            429 => SemIndexError::TransientRateLimit {
                target: target.to_string(),
            },
            408 | 425 => SemIndexError::TransientNetwork {
                target: target.to_string(),
                detail: format!("HTTP {status}"),
            },
            s if s >= 500 => SemIndexError::TransientNetwork {
                target: target.to_string(),
                detail: format!("HTTP {s}: {body}"),
            },
            401 | 403 => SemIndexError::Auth {
                target: target.to_string(),
                detail: format!("HTTP {status}: {body}"),
            },
            s => SemIndexError::Model(format!("{target} returned HTTP {s}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_transient() {
        let err = SemIndexError::from_status(429, "llm", String::new());
        assert!(err.is_transient());
    }

    #[test]
    fn server_error_is_transient() {
        let err = SemIndexError::from_status(503, "qdrant", "overloaded".into());
        assert!(err.is_transient());
    }

    #[test]
    fn auth_is_fatal() {
        let err = SemIndexError::from_status(401, "confluence", String::new());
        assert!(!err.is_transient());
        assert!(matches!(err, SemIndexError::Auth { .. }));
    }

    #[test]
    fn other_4xx_is_model_error() {
        let err = SemIndexError::from_status(422, "llm", "bad input".into());
        assert!(!err.is_transient());
        assert!(matches!(err, SemIndexError::Model(_)));
    }
}
