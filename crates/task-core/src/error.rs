use thiserror::Error;

/// Domain-level error kinds shared across the pipeline (spec.md §7).
///
/// `MalformedResponse` is deliberately absorbed by `task-split` and never
/// surfaced past it; it stays in this enum because `task-llm` still needs a
/// typed variant to return internally.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting state transition: {0}")]
    ConflictState(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("internal error [{id}]: {detail}")]
    Internal { id: String, detail: String },
}

impl Error {
    pub fn internal(detail: impl Into<String>) -> Self {
        Error::Internal {
            id: uuid::Uuid::new_v4().to_string(),
            detail: detail.into(),
        }
    }

    /// Stable machine-readable code, never a display string (spec.md §7).
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::ConflictState(_) => "conflict_state",
            Error::Unavailable(_) => "unavailable",
            Error::MalformedResponse(_) => "malformed_response",
            Error::Timeout(_) => "timeout",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::Internal { .. } => "internal",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::Unavailable(_) | Error::Timeout(_) | Error::QuotaExceeded(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
