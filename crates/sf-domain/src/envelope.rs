//! The event envelope published between stage completions, and the
//! push-delivery wrapper it travels in on the wire.

use crate::ids::RunId;
use crate::stage::Stage;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of event types. Kept as an enum (not a free-form string)
/// per the decision to make illegal event names unrepresentable; the
/// wire form is still the dotted `stage.verb` string from spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "transcribe.requested")]
    TranscribeRequested,
    #[serde(rename = "transcribe.completed")]
    TranscribeCompleted,
    #[serde(rename = "transcribe.failed")]
    TranscribeFailed,
    #[serde(rename = "redact.requested")]
    RedactRequested,
    #[serde(rename = "redact.completed")]
    RedactCompleted,
    #[serde(rename = "redact.failed")]
    RedactFailed,
    #[serde(rename = "audit.requested")]
    AuditRequested,
    #[serde(rename = "audit.completed")]
    AuditCompleted,
    #[serde(rename = "audit.failed")]
    AuditFailed,
    #[serde(rename = "soap.requested")]
    SoapRequested,
    #[serde(rename = "soap.completed")]
    SoapCompleted,
    #[serde(rename = "soap.failed")]
    SoapFailed,
}

impl EventType {
    pub fn requested(stage: Stage) -> Self {
        match stage {
            Stage::Transcribe => EventType::TranscribeRequested,
            Stage::Redact => EventType::RedactRequested,
            Stage::Audit => EventType::AuditRequested,
            Stage::Soap => EventType::SoapRequested,
        }
    }

    pub fn completed(stage: Stage) -> Self {
        match stage {
            Stage::Transcribe => EventType::TranscribeCompleted,
            Stage::Redact => EventType::RedactCompleted,
            Stage::Audit => EventType::AuditCompleted,
            Stage::Soap => EventType::SoapCompleted,
        }
    }

    pub fn failed(stage: Stage) -> Self {
        match stage {
            Stage::Transcribe => EventType::TranscribeFailed,
            Stage::Redact => EventType::RedactFailed,
            Stage::Audit => EventType::AuditFailed,
            Stage::Soap => EventType::SoapFailed,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            EventType::TranscribeRequested
            | EventType::TranscribeCompleted
            | EventType::TranscribeFailed => Stage::Transcribe,
            EventType::RedactRequested | EventType::RedactCompleted | EventType::RedactFailed => {
                Stage::Redact
            }
            EventType::AuditRequested | EventType::AuditCompleted | EventType::AuditFailed => {
                Stage::Audit
            }
            EventType::SoapRequested | EventType::SoapCompleted | EventType::SoapFailed => {
                Stage::Soap
            }
        }
    }
}

/// The input reference carried inline on every envelope, mirroring
/// `ids::InputRef` but with `session` instead of `session_id` to match
/// the on-the-wire shape exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeInput {
    pub bucket: String,
    pub name: String,
    pub generation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// Immutable message passed between the orchestrator and stage workers.
/// Carries references only, never artifact payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: u32,
    pub event_type: EventType,
    pub run_id: RunId,
    pub step: Stage,
    pub input: EnvelopeInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<serde_json::Value>,
    pub correlation_id: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl EventEnvelope {
    /// Ordering key for the message bus: per-run FIFO.
    pub fn ordering_key(&self) -> &str {
        self.run_id.as_str()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeDecodeError {
    #[error("malformed push envelope: {0}")]
    MalformedWrapper(String),
    #[error("data field is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("decoded payload is not a valid event envelope: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        f.write_str(&s)
    }
}

/// GCP-Pub/Sub-style push wrapper: `{ message: { messageId, publishTime,
/// data: base64(json), attributes?, orderingKey? } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "publishTime")]
    pub publish_time: DateTime<Utc>,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
    #[serde(rename = "orderingKey", default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
}

impl PushEnvelope {
    /// Decode the base64 `data` field into any JSON-shaped payload. Any
    /// failure here is permanent: a malformed push body is never going
    /// to parse on retry.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, EnvelopeDecodeError> {
        let bytes = STANDARD.decode(&self.message.data)?;
        let value = serde_json::from_slice(&bytes)?;
        Ok(value)
    }

    /// Decode the base64 `data` field into an `EventEnvelope`.
    pub fn decode_event(&self) -> Result<EventEnvelope, EnvelopeDecodeError> {
        self.decode()
    }

    pub fn encode(event: &EventEnvelope, message_id: String, now: DateTime<Utc>) -> Self {
        let json = serde_json::to_vec(event).expect("EventEnvelope always serializes");
        Self {
            message: PushMessage {
                message_id,
                publish_time: now,
                data: STANDARD.encode(json),
                attributes: None,
                ordering_key: Some(event.ordering_key().to_string()),
            },
            subscription: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> EventEnvelope {
        EventEnvelope {
            version: 1,
            event_type: EventType::TranscribeCompleted,
            run_id: RunId::from_hex("deadbeef"),
            step: Stage::Transcribe,
            input: EnvelopeInput {
                bucket: "bkt".into(),
                name: "a.wav".into(),
                generation: "1".into(),
                session: None,
            },
            artifacts: None,
            correlation_id: "corr-1".into(),
            ts: Utc::now(),
            idempotency_key: None,
        }
    }

    #[test]
    fn event_type_round_trips_through_wire_strings() {
        let json = serde_json::to_string(&EventType::AuditFailed).unwrap();
        assert_eq!(json, "\"audit.failed\"");
        let back: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventType::AuditFailed);
    }

    #[test]
    fn push_envelope_round_trip() {
        let event = sample_event();
        let push = PushEnvelope::encode(&event, "msg-1".into(), Utc::now());
        let decoded = push.decode_event().unwrap();
        assert_eq!(decoded.run_id, event.run_id);
        assert_eq!(decoded.event_type, event.event_type);
    }

    #[test]
    fn ordering_key_is_the_run_id() {
        let event = sample_event();
        assert_eq!(event.ordering_key(), "deadbeef");
    }
}
