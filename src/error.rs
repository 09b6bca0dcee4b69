use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Filesystem or provider blip. Retried with backoff at the lowest
    /// layer; surfaced only after exhaustion.
    #[error("transient io failure: {0}")]
    TransientIo(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed frontmatter or text encoding. Callers apply defaults and
    /// keep going; this variant only escapes when there is nothing to
    /// degrade to.
    #[error("parse error in {context}: {message}")]
    Parse { context: String, message: String },

    /// A contract between components was broken (e.g. embedding count
    /// mismatch). Fatal for the current task, never for the process.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Retryable embedding provider failure.
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector store failure: {0}")]
    Store(String),

    /// Cooperative cancellation. Propagated upward without being logged as
    /// an error.
    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    /// The monitor's pending queue hit its bound. Escalates to a full sync
    /// instead of surfacing to the user.
    #[error("event queue saturated")]
    Saturated,

    #[error("configuration error: {0}")]
    Config(String),

    /// A failure observed through the single-flight cache: every waiter on
    /// the same in-flight computation sees the same underlying error.
    #[error("{0}")]
    Shared(Arc<EngineError>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether a retry at the same layer can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::TransientIo(_) | EngineError::Embedding(_) => true,
            EngineError::Io(e) => !matches!(e.kind(), std::io::ErrorKind::NotFound),
            EngineError::Shared(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::Shared(inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::NotFound(_) => true,
            EngineError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            EngineError::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
