//! The two-kind error taxonomy shared by every service boundary:
//! retryable (surfaced as 503, callers retry) vs. permanent
//! (surfaced as 422, callers must stop retrying).

use std::fmt;

/// Business-logic and adapter error, classified once at the point it
/// is raised so every HTTP/worker boundary can map it mechanically.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn retryable(msg: impl fmt::Display) -> Self {
        Self::Retryable(msg.to_string())
    }

    pub fn permanent(msg: impl fmt::Display) -> Self {
        Self::Permanent(msg.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Retryable(m) | StageError::Permanent(m) => m,
        }
    }
}

/// Pure domain-level validation error, e.g. a malformed `InputRef` or
/// an artifact that fails its shape check. Always permanent by
/// construction: domain validation never depends on network state.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
}

impl From<DomainError> for StageError {
    fn from(e: DomainError) -> Self {
        StageError::Permanent(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_and_permanent_classify_correctly() {
        assert!(StageError::retryable("timeout").is_retryable());
        assert!(!StageError::permanent("bad schema").is_retryable());
    }

    #[test]
    fn domain_error_converts_to_permanent_stage_error() {
        let e: StageError = DomainError::MissingField("bucket").into();
        assert!(!e.is_retryable());
    }
}
