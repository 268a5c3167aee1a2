//! Identity derivation: run ids, idempotency keys, task names.
//!
//! `RunId` is the stable hash of `(bucket, object_name, object_generation,
//! session_id?)`. The same input tuple always yields the same `RunId`,
//! which is what lets ingestion, the orchestrator, and every stage
//! worker agree on a single logical run without a central allocator.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Reference to the uploaded object that triggered a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub bucket: String,
    pub name: String,
    pub generation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl InputRef {
    pub fn new(
        bucket: impl Into<String>,
        name: impl Into<String>,
        generation: impl Into<String>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            generation: generation.into(),
            session_id,
        }
    }

    /// Raw bytes hashed to derive the idempotency key, matching the
    /// `bucket/name@generation|session?` convention used across every
    /// service in the pipeline.
    fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "{}/{}@{}|{}",
            self.bucket,
            self.name,
            self.generation,
            self.session_id.as_deref().unwrap_or(""),
        )
        .into_bytes()
    }

    pub fn idempotency_key(&self) -> RunId {
        let digest = Sha256::digest(self.canonical_bytes());
        RunId(hex::encode(digest))
    }
}

/// Stable run identity: `sha256(bucket/name@generation|session?)`.
///
/// Deterministic and content-addressed, so redelivered ingestion
/// notifications for the same object always resolve to the same run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn from_input(input: &InputRef) -> Self {
        input.idempotency_key()
    }

    /// Accept an already-hex-encoded id, e.g. read back from storage.
    pub fn from_hex(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Idempotency key for the ingestion dedup record. Distinct type from
/// `RunId` even though it is numerically identical today, so ingestion's
/// "have I seen this input tuple" question stays conceptually separate
/// from the orchestrator's "what run does this belong to" question.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn from_input(input: &InputRef) -> Self {
        Self(input.idempotency_key().0)
    }

    /// Accept an already-hex-encoded key, e.g. read back from storage.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_run_id(&self) -> RunId {
        RunId(self.0.clone())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic() {
        let a = InputRef::new("bkt", "a.wav", "1", None);
        let b = InputRef::new("bkt", "a.wav", "1", None);
        assert_eq!(a.idempotency_key(), b.idempotency_key());
    }

    #[test]
    fn session_id_changes_the_key() {
        let a = InputRef::new("bkt", "a.wav", "1", None);
        let b = InputRef::new("bkt", "a.wav", "1", Some("sess-1".to_string()));
        assert_ne!(a.idempotency_key(), b.idempotency_key());
    }

    #[test]
    fn generation_changes_the_key() {
        let a = InputRef::new("bkt", "a.wav", "1", None);
        let b = InputRef::new("bkt", "a.wav", "2", None);
        assert_ne!(a.idempotency_key(), b.idempotency_key());
    }
}
