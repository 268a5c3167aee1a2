//! External model-call ports: the boundary each stage handler calls
//! through to reach a speech-to-text backend, a PHI detector, a
//! compliance-judging LLM, or a note-generating LLM.
//!
//! These are declared here rather than in `sf-ports` because they are
//! stage-local capabilities, not shared infrastructure ports — each
//! stage crate implements exactly one of them against its own model
//! backend, and each ships a deterministic stub for its own tests.

use crate::artifact::{AuditArtifact, RedactionSummary};
use std::future::Future;

#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<crate::artifact::TranscriptSegment>,
    pub duration: Option<f64>,
    pub model_used: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelCallError {
    #[error("upstream timeout")]
    Timeout,
    #[error("upstream rate limited")]
    RateLimited,
    #[error("upstream returned {status}")]
    UpstreamStatus { status: u16 },
    #[error("response failed schema validation: {0}")]
    InvalidResponse(String),
}

impl ModelCallError {
    /// Timeouts, 429s and 5xx map to retryable; a response that fails
    /// schema validation after the in-call retry budget is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelCallError::Timeout | ModelCallError::RateLimited => true,
            ModelCallError::UpstreamStatus { status } => *status >= 500,
            ModelCallError::InvalidResponse(_) => false,
        }
    }
}

pub trait SpeechToText: Send + Sync {
    fn transcribe(
        &self,
        audio_bucket: &str,
        audio_name: &str,
        language_hint: Option<&str>,
    ) -> impl Future<Output = Result<TranscriptionResult, ModelCallError>> + Send;
}

#[derive(Debug, Clone)]
pub struct PhiDetectionResult {
    pub text: String,
    pub summary: RedactionSummary,
}

pub trait PhiDetector: Send + Sync {
    /// Deterministic Safe Harbor + address detection and masking.
    /// Not model-backed in the reference deployment, but kept as a
    /// trait so a learned detector can be swapped in without touching
    /// the stage handler.
    fn detect_and_mask(
        &self,
        text: &str,
        salt: &str,
    ) -> impl Future<Output = Result<PhiDetectionResult, ModelCallError>> + Send;
}

pub trait ComplianceJudge: Send + Sync {
    fn judge(
        &self,
        redacted_transcript: &str,
    ) -> impl Future<Output = Result<AuditArtifact, ModelCallError>> + Send;
}

pub trait NoteGenerator: Send + Sync {
    fn generate(
        &self,
        redacted_transcript: &str,
        language: Option<&str>,
    ) -> impl Future<Output = Result<String, ModelCallError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_timeout_are_retryable() {
        assert!(ModelCallError::Timeout.is_retryable());
        assert!(ModelCallError::RateLimited.is_retryable());
    }

    #[test]
    fn invalid_response_is_permanent() {
        assert!(!ModelCallError::InvalidResponse("not json".into()).is_retryable());
    }

    #[test]
    fn upstream_status_splits_on_500() {
        assert!(ModelCallError::UpstreamStatus { status: 503 }.is_retryable());
        assert!(!ModelCallError::UpstreamStatus { status: 422 }.is_retryable());
    }
}
