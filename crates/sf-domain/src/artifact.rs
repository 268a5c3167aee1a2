//! Typed artifact shapes, one per stage. Serialized bare (no envelope)
//! at `artifacts/<run_id>/<stage>.json`; existence of the object at
//! that path implies a completed, schema-valid artifact.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptArtifact {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedactionSummary {
    #[serde(default)]
    pub entities: HashMap<String, u64>,
    #[serde(default)]
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactedArtifact {
    pub text: String,
    #[serde(default)]
    pub summary: RedactionSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailIdentifier {
    #[serde(rename = "type")]
    pub identifier_type: String,
    pub text: String,
    pub position: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditArtifact {
    pub hipaa_compliant: bool,
    #[serde(default)]
    pub fail_identifiers: Vec<FailIdentifier>,
    #[serde(default)]
    pub comments: String,
    /// Authoritative pass/fail flag for branching to the soap stage.
    /// Taken at face value even when `fail_identifiers` is empty.
    pub hipaa_pass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoapArtifact {
    /// A single string delimited by `<soap_note>` markers, matching the
    /// upstream note generator's wrapper format verbatim.
    pub soap_note: String,
}

/// In-process union of the four artifact shapes. Serialized bare (the
/// variant tag never appears on the wire or at rest) — the stage that
/// wrote the artifact is already implied by its storage path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Artifact {
    Transcript(TranscriptArtifact),
    Redacted(RedactedArtifact),
    Audit(AuditArtifact),
    Soap(SoapArtifact),
}

impl SoapArtifact {
    pub fn wrapped(note_body: &str) -> Self {
        Self {
            soap_note: format!("<soap_note>{}</soap_note>", note_body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_identifier_serializes_type_field_unrenamed() {
        let fi = FailIdentifier {
            identifier_type: "name".into(),
            text: "[NAME_abc12345]".into(),
            position: "segment 3, token 12".into(),
        };
        let json = serde_json::to_value(&fi).unwrap();
        assert_eq!(json["type"], "name");
    }

    #[test]
    fn soap_note_is_wrapped_in_markers() {
        let artifact = SoapArtifact::wrapped("S: ...\nO: ...");
        assert!(artifact.soap_note.starts_with("<soap_note>"));
        assert!(artifact.soap_note.ends_with("</soap_note>"));
    }
}
