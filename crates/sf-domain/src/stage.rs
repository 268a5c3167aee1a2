//! Stage identity and per-stage record shape.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The four fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Transcribe,
    Redact,
    Audit,
    Soap,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Transcribe, Stage::Redact, Stage::Audit, Stage::Soap];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Transcribe => "transcribe",
            Stage::Redact => "redact",
            Stage::Audit => "audit",
            Stage::Soap => "soap",
        }
    }

    /// The stage immediately following this one, if any. `Soap` is terminal.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Transcribe => Some(Stage::Redact),
            Stage::Redact => Some(Stage::Audit),
            Stage::Audit => Some(Stage::Soap),
            Stage::Soap => None,
        }
    }

    /// Artifact object name under `artifacts/<run_id>/<name>.json`.
    /// The audit branch point aside, these match `Stage::as_str` except
    /// for `soap`, whose artifact is named `soap-note`.
    pub fn artifact_name(&self) -> &'static str {
        match self {
            Stage::Transcribe => "transcript",
            Stage::Redact => "redacted",
            Stage::Audit => "audit",
            Stage::Soap => "soap-note",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Stage> {
        match s {
            "transcribe" => Some(Stage::Transcribe),
            "redact" => Some(Stage::Redact),
            "audit" => Some(Stage::Audit),
            "soap" => Some(Stage::Soap),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage record status. `Completed` is a terminal sink: any handler
/// observing a stage already `Completed` must no-op, never transition away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Completed,
    Failed,
}

/// One (run, stage) record, owned exclusively by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default)]
    pub artifacts: serde_json::Value,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    pub fn pending(stage: Stage, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            artifacts: serde_json::Value::Null,
            updated_at: now,
            error: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, StageStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_fixed() {
        assert_eq!(Stage::Transcribe.next(), Some(Stage::Redact));
        assert_eq!(Stage::Redact.next(), Some(Stage::Audit));
        assert_eq!(Stage::Audit.next(), Some(Stage::Soap));
        assert_eq!(Stage::Soap.next(), None);
    }

    #[test]
    fn soap_artifact_name_differs_from_stage_name() {
        assert_eq!(Stage::Soap.as_str(), "soap");
        assert_eq!(Stage::Soap.artifact_name(), "soap-note");
    }
}
