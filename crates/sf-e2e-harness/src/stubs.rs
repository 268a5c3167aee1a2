//! Harness-local `StageSpec` implementations and deterministic model
//! port stubs, grounded on the real `sf-stage-*` bins
//! (`sf-stage-transcribe`, `sf-stage-redact`, `sf-stage-audit`,
//! `sf-stage-soap`). Those crates are bin-only with no lib surface, so
//! their `main.rs` logic can't be imported directly; this module
//! reimplements the same shapes against stub backends instead of real
//! HTTP model calls.

use std::collections::HashMap;
use std::sync::Mutex;

use sf_domain::{
    AuditArtifact, EnvelopeInput, ModelCallError, PhiDetectionResult, RedactedArtifact, RedactionSummary, RunId,
    SoapArtifact, StageError, TranscriptArtifact, TranscriptionResult,
};
use sf_worker::StageSpec;

/// Always succeeds with a fixed transcript, unless primed with queued
/// responses via `with_script` to exercise retry/failure scenarios.
pub struct StubSpeechToText {
    script: Mutex<Vec<Result<TranscriptionResult, ModelCallError>>>,
    default_text: String,
}

impl StubSpeechToText {
    pub fn new(default_text: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            default_text: default_text.into(),
        }
    }

    pub fn with_script(mut self, script: Vec<Result<TranscriptionResult, ModelCallError>>) -> Self {
        self.script = Mutex::new(script);
        self
    }

    fn next(&self) -> Result<TranscriptionResult, ModelCallError> {
        let mut guard = self.script.lock().unwrap();
        if !guard.is_empty() {
            return guard.remove(0);
        }
        Ok(TranscriptionResult {
            text: self.default_text.clone(),
            language: Some("en".to_string()),
            segments: Vec::new(),
            duration: Some(12.0),
            model_used: Some("stub-stt".to_string()),
        })
    }
}

impl sf_domain::SpeechToText for StubSpeechToText {
    async fn transcribe(
        &self,
        _audio_bucket: &str,
        _audio_name: &str,
        _language_hint: Option<&str>,
    ) -> Result<TranscriptionResult, ModelCallError> {
        self.next()
    }
}

pub struct TranscribeSpec<T: sf_domain::SpeechToText> {
    pub stt: T,
}

impl<T: sf_domain::SpeechToText + Send + Sync + 'static> StageSpec for TranscribeSpec<T> {
    const STAGE: sf_domain::Stage = sf_domain::Stage::Transcribe;
    type Output = TranscriptArtifact;

    async fn execute(
        &self,
        _run_id: &RunId,
        input: &EnvelopeInput,
        _predecessor_artifact: Option<&[u8]>,
    ) -> Result<Self::Output, StageError> {
        let result = self
            .stt
            .transcribe(&input.bucket, &input.name, None)
            .await
            .map_err(|e| if e.is_retryable() { StageError::retryable(e) } else { StageError::permanent(e) })?;
        Ok(TranscriptArtifact {
            text: result.text,
            language: result.language,
            segments: result.segments,
            duration: result.duration,
            model_used: result.model_used,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }
}

/// Deterministic single-pattern PHI detector: masks any substring
/// matching a `[[PHI:<TYPE>:<span>]]` marker the scenario planted in
/// the sample transcript, via the same salted-hash token scheme
/// `sf-stage-redact` uses (`deterministic_token`), so two runs over
/// identical input/salt redact identically.
pub struct StubPhiDetector;

fn deterministic_token(entity_type: &str, span: &str, salt: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(format!("{salt}|{entity_type}|{span}").as_bytes());
    format!("[{}_{}]", entity_type.to_uppercase(), &hex::encode(digest)[..8])
}

impl sf_domain::PhiDetector for StubPhiDetector {
    async fn detect_and_mask(&self, text: &str, salt: &str) -> Result<PhiDetectionResult, ModelCallError> {
        let mut masked = String::new();
        let mut entities: HashMap<String, u64> = HashMap::new();
        let mut total = 0u64;
        let mut rest = text;
        while let Some(start) = rest.find("[[PHI:") {
            let Some(end) = rest[start..].find("]]").map(|i| start + i + 2) else {
                break;
            };
            masked.push_str(&rest[..start]);
            let marker = &rest[start + 6..end - 2];
            let mut parts = marker.splitn(2, ':');
            let entity_type = parts.next().unwrap_or("unknown");
            let span = parts.next().unwrap_or("");
            masked.push_str(&deterministic_token(entity_type, span, salt));
            *entities.entry(entity_type.to_string()).or_insert(0) += 1;
            total += 1;
            rest = &rest[end..];
        }
        masked.push_str(rest);
        Ok(PhiDetectionResult {
            text: masked,
            summary: RedactionSummary {
                entities,
                total,
                policy: Some("harness-stub-markers".to_string()),
            },
        })
    }
}

pub struct RedactSpec<D: sf_domain::PhiDetector> {
    pub detector: D,
    pub salt: String,
}

impl<D: sf_domain::PhiDetector + Send + Sync + 'static> StageSpec for RedactSpec<D> {
    const STAGE: sf_domain::Stage = sf_domain::Stage::Redact;
    type Output = RedactedArtifact;

    async fn execute(
        &self,
        _run_id: &RunId,
        _input: &EnvelopeInput,
        predecessor_artifact: Option<&[u8]>,
    ) -> Result<Self::Output, StageError> {
        let bytes = predecessor_artifact.ok_or_else(|| StageError::permanent("missing transcript predecessor"))?;
        let transcript: TranscriptArtifact =
            serde_json::from_slice(bytes).map_err(|e| StageError::permanent(format!("transcript unreadable: {e}")))?;
        let result = self
            .detector
            .detect_and_mask(&transcript.text, &self.salt)
            .await
            .map_err(|e| if e.is_retryable() { StageError::retryable(e) } else { StageError::permanent(e) })?;
        Ok(RedactedArtifact {
            text: result.text,
            summary: result.summary,
        })
    }
}

/// Scripted compliance judge: queued responses consumed in order, with
/// the in-call retry-once-on-invalid-response behavior of the real
/// `HttpComplianceJudge` reproduced here.
pub struct StubComplianceJudge {
    script: Mutex<Vec<Result<AuditArtifact, ModelCallError>>>,
}

impl StubComplianceJudge {
    pub fn new(script: Vec<Result<AuditArtifact, ModelCallError>>) -> Self {
        Self { script: Mutex::new(script) }
    }

    fn call_once(&self) -> Result<AuditArtifact, ModelCallError> {
        let mut guard = self.script.lock().unwrap();
        if guard.is_empty() {
            return Ok(AuditArtifact {
                hipaa_compliant: true,
                fail_identifiers: Vec::new(),
                comments: String::new(),
                hipaa_pass: true,
            });
        }
        guard.remove(0)
    }
}

impl sf_domain::ComplianceJudge for StubComplianceJudge {
    async fn judge(&self, _redacted_transcript: &str) -> Result<AuditArtifact, ModelCallError> {
        match self.call_once() {
            Ok(artifact) => Ok(artifact),
            Err(e) if e.is_retryable() => Err(e),
            Err(first) => match self.call_once() {
                Ok(artifact) => Ok(artifact),
                Err(second) if second.is_retryable() => Err(second),
                Err(second) => Err(ModelCallError::InvalidResponse(format!(
                    "audit response invalid after retry: {first}, then {second}"
                ))),
            },
        }
    }
}

pub struct AuditSpec<J: sf_domain::ComplianceJudge> {
    pub judge: J,
}

impl<J: sf_domain::ComplianceJudge + Send + Sync + 'static> StageSpec for AuditSpec<J> {
    const STAGE: sf_domain::Stage = sf_domain::Stage::Audit;
    type Output = AuditArtifact;

    async fn execute(
        &self,
        _run_id: &RunId,
        _input: &EnvelopeInput,
        predecessor_artifact: Option<&[u8]>,
    ) -> Result<Self::Output, StageError> {
        let bytes = predecessor_artifact.ok_or_else(|| StageError::permanent("missing redacted predecessor"))?;
        let redacted: RedactedArtifact =
            serde_json::from_slice(bytes).map_err(|e| StageError::permanent(format!("redacted text unreadable: {e}")))?;
        if redacted.text.is_empty() {
            return Err(StageError::permanent("redacted text is empty"));
        }
        let mut artifact = self
            .judge
            .judge(&redacted.text)
            .await
            .map_err(|e| if e.is_retryable() { StageError::retryable(e) } else { StageError::permanent(e) })?;
        artifact.hipaa_pass = artifact.hipaa_compliant;
        Ok(artifact)
    }

    fn completion_summary(&self, output: &Self::Output) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("hipaa_pass".to_string(), serde_json::Value::Bool(output.hipaa_pass));
        map
    }
}

const REQUIRED_HEADINGS: [&str; 4] = ["Subjective", "Objective", "Assessment", "Plan"];

fn headings_in_order(wrapped: &str) -> bool {
    let inner = wrapped
        .strip_prefix("<soap_note>")
        .and_then(|s| s.strip_suffix("</soap_note>"))
        .unwrap_or(wrapped);
    let mut cursor = 0usize;
    for heading in REQUIRED_HEADINGS {
        match inner[cursor..].find(heading) {
            Some(pos) => cursor += pos + heading.len(),
            None => return false,
        }
    }
    true
}

fn default_wrapped_note() -> String {
    SoapArtifact::wrapped(
        "Subjective: patient reports no new symptoms.\nObjective: vitals stable.\nAssessment: stable, chronic condition managed.\nPlan: continue current regimen.",
    )
    .soap_note
}

pub struct StubNoteGenerator {
    script: Mutex<Vec<Result<String, ModelCallError>>>,
}

impl StubNoteGenerator {
    pub fn new(script: Vec<Result<String, ModelCallError>>) -> Self {
        Self { script: Mutex::new(script) }
    }

    pub fn well_formed() -> Self {
        Self::new(vec![Ok(default_wrapped_note())])
    }
}

impl sf_domain::NoteGenerator for StubNoteGenerator {
    async fn generate(&self, _redacted_transcript: &str, _language: Option<&str>) -> Result<String, ModelCallError> {
        let mut guard = self.script.lock().unwrap();
        if guard.is_empty() {
            return Ok(default_wrapped_note());
        }
        guard.remove(0)
    }
}

pub struct SoapSpec<N: sf_domain::NoteGenerator> {
    pub generator: N,
}

impl<N: sf_domain::NoteGenerator + Send + Sync + 'static> StageSpec for SoapSpec<N> {
    const STAGE: sf_domain::Stage = sf_domain::Stage::Soap;
    type Output = SoapArtifact;

    async fn execute(
        &self,
        _run_id: &RunId,
        _input: &EnvelopeInput,
        predecessor_artifact: Option<&[u8]>,
    ) -> Result<Self::Output, StageError> {
        let bytes = predecessor_artifact.ok_or_else(|| StageError::permanent("missing redacted predecessor"))?;
        let redacted: RedactedArtifact =
            serde_json::from_slice(bytes).map_err(|e| StageError::permanent(format!("redacted text unreadable: {e}")))?;
        if redacted.text.is_empty() {
            return Err(StageError::permanent("redacted text is empty"));
        }
        let note = self
            .generator
            .generate(&redacted.text, None)
            .await
            .map_err(|e| if e.is_retryable() { StageError::retryable(e) } else { StageError::permanent(e) })?;
        Ok(SoapArtifact { soap_note: note })
    }

    fn validate(&self, output: &Self::Output) -> Result<(), StageError> {
        if headings_in_order(&output.soap_note) {
            Ok(())
        } else {
            Err(StageError::permanent(
                "soap note missing required headings in order: Subjective, Objective, Assessment, Plan",
            ))
        }
    }
}
