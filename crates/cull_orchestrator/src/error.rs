//! Error types for the reduction pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failures at the chunk-store boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Invalid key '{0}'")]
    InvalidKey(String),

    /// May succeed on retry.
    #[error("Transient store failure on {key}: {message}")]
    Transient { key: String, message: String },

    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn transient(key: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Transient {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            key: key.into(),
            source,
        }
    }

    /// Whether the retry layer should try again.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient { .. } => true,
            StoreError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            StoreError::NotFound(_) | StoreError::InvalidKey(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Store retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// A persisted chunk could not be decoded.
    #[error("Corrupt chunk {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Source {path}: {message}")]
    Source { path: String, message: String },

    #[error("Invalid plan: {0}")]
    Plan(String),

    #[error("Chunk {key} is {size} bytes, over the {budget} byte budget")]
    ChunkTooLarge { key: String, size: usize, budget: usize },

    #[error("Stage {stage} cannot start: {reason}")]
    NotReady { stage: String, reason: String },

    #[error("Cancelled during stage {0}")]
    Cancelled(String),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PipelineError {
    pub fn source_error(path: impl std::fmt::Display, message: impl Into<String>) -> Self {
        PipelineError::Source {
            path: path.to_string(),
            message: message.into(),
        }
    }

    pub fn plan(message: impl Into<String>) -> Self {
        PipelineError::Plan(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::transient("k", "503").is_transient());
        assert!(StoreError::io("k", std::io::ErrorKind::TimedOut.into()).is_transient());
        assert!(!StoreError::io("k", std::io::ErrorKind::PermissionDenied.into()).is_transient());
        assert!(!StoreError::NotFound("k".into()).is_transient());
    }
}
