//! The ingestion dedup record: the gateway's own idempotency ledger,
//! separate from the orchestrator's run/stage state.

use crate::ids::IdempotencyKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionStatus {
    Processing,
    Done,
    FailedTransient,
    FailedPermanent,
}

impl IngestionStatus {
    /// Whether a redelivered notification for the same input should be
    /// treated as a no-op rather than re-dispatched to the orchestrator.
    pub fn is_settled(&self) -> bool {
        matches!(self, IngestionStatus::Done | IngestionStatus::FailedPermanent)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub idempotency_key: IdempotencyKey,
    pub status: IngestionStatus,
    pub attempt_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ttl_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestionRecord {
    pub fn new_processing(idempotency_key: IdempotencyKey, now: DateTime<Utc>, ttl_days: i64) -> Self {
        Self {
            idempotency_key,
            status: IngestionStatus::Processing,
            attempt_count: 1,
            first_seen_at: now,
            updated_at: now,
            ttl_at: now + chrono::Duration::days(ttl_days),
            error: None,
        }
    }

    /// Whether `ttl_at` has passed as of `now`; TTL-expired records may be
    /// reaped without violating any "never re-run" property, since the
    /// input was already processed past the ingestion gateway.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_and_failed_permanent_are_settled() {
        assert!(IngestionStatus::Done.is_settled());
        assert!(IngestionStatus::FailedPermanent.is_settled());
        assert!(!IngestionStatus::Processing.is_settled());
        assert!(!IngestionStatus::FailedTransient.is_settled());
    }

    #[test]
    fn ttl_expiry_is_relative_to_first_seen() {
        let now = Utc::now();
        let record = IngestionRecord::new_processing(
            IdempotencyKey::from_input(&crate::ids::InputRef::new("b", "n", "1", None)),
            now,
            14,
        );
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + chrono::Duration::days(15)));
    }
}
