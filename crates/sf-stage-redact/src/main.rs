//! Redact stage worker: deterministic PHI masking over the transcript
//! text produced by the transcribe stage. Runs a `PhiDetector` over the
//! eight pattern categories this recognizer ships with (address, email,
//! phone, SSN, date/time, medical license, credit card, passport) and
//! replaces each detected span with a salted, content-addressed token.
//! The recognizer does not cover the full HIPAA Safe Harbor set (e.g.
//! it has no name/location NER); `RedactionSummary.policy` names the
//! configured policy label so callers can tell which coverage produced
//! a given artifact.

use axum::{routing::get, routing::post, Json, Router};
use regex::Regex;
use sf_auth::{GcpMetadataTokenMinter, OidcConfig, OidcProvider};
use sf_config::{env_or, require_env, PipelineConfig};
use sf_domain::{
    EnvelopeInput, ModelCallError, PhiDetectionResult, PhiDetector, RedactedArtifact,
    RedactionSummary, RunId, Stage, StageError,
};
use sf_messaging::{NatsConfig, NatsMessageBus};
use sf_object_store::{ObjectStoreConfig, S3ArtifactStore};
use sf_observability::{
    init_tracing, metrics_endpoint, metrics_middleware, request_context_middleware, Metrics,
    MetricsState,
};
use sf_store_postgres::PostgresStateStore;
use sf_taskqueue::{HttpTaskQueueClient, TaskQueueConfig};
use sf_worker::{push_receiver, task_executor, StageSpec, StageWorker, WorkerConfig};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Entity type → regex, for the eight categories this recognizer
/// covers. Simpler than a full NER model; this is the deterministic
/// pattern set the redact stage ships with, not the complete HIPAA
/// Safe Harbor list.
struct PatternPhiDetector {
    patterns: Vec<(&'static str, Regex)>,
    policy: String,
}

impl PatternPhiDetector {
    fn new(policy: String) -> Self {
        let patterns = vec![
            (
                "ADDRESS",
                Regex::new(
                    r"(?i)\b\d{1,6}\s+[A-Z][a-zA-Z]+\s(?:[A-Z][a-zA-Z]+\s)?(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Way|Trail|Trl|Parkway|Pkwy)\b,?\s+[A-Za-z .'-]+,\s*[A-Za-z]{2}\s+\d{5}\b",
                )
                .unwrap(),
            ),
            (
                "EMAIL_ADDRESS",
                Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
            ),
            (
                "PHONE_NUMBER",
                Regex::new(r"\b(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]\d{3}[-.\s]\d{4}\b").unwrap(),
            ),
            ("US_SSN", Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap()),
            (
                "DATE_TIME",
                Regex::new(r"\b\d{4}-\d{2}-\d{2}\b|\b\d{1,2}/\d{1,2}/\d{2,4}\b").unwrap(),
            ),
            (
                "MEDICAL_LICENSE",
                Regex::new(r"(?i)\bMD\s*#?\s*\d{5,8}\b").unwrap(),
            ),
            (
                "CREDIT_CARD",
                Regex::new(r"\b(?:\d[ -]?){13,16}\b").unwrap(),
            ),
            (
                "US_PASSPORT",
                Regex::new(r"(?i)\bpassport\s*#?\s*[A-Z0-9]{6,9}\b").unwrap(),
            ),
        ];
        Self { patterns, policy }
    }

    /// Deterministic masking: sort detections by `(start, end)`, walk a
    /// cursor left to right, and drop any detection whose start falls
    /// before the cursor (an inner overlap of an already-emitted span).
    /// The configured `policy` label is recorded on the summary
    /// verbatim — it names which detector coverage produced this
    /// artifact, it is not asserted to be any particular standard.
    fn mask(&self, text: &str, salt: &str) -> (String, RedactionSummary) {
        let mut spans: Vec<(usize, usize, &'static str)> = Vec::new();
        for (entity_type, re) in &self.patterns {
            for m in re.find_iter(text) {
                spans.push((m.start(), m.end(), entity_type));
            }
        }
        apply_deterministic_mask(text, spans, salt, &self.policy)
    }
}

/// Sort detections by `(start, end)`, walk a cursor left to right, and
/// drop any detection whose start falls before the cursor — i.e. an
/// inner overlap of an already-emitted outer span. Exactly one token is
/// emitted per non-overlapping region.
fn apply_deterministic_mask(
    text: &str,
    mut spans: Vec<(usize, usize, &'static str)>,
    salt: &str,
    policy: &str,
) -> (String, RedactionSummary) {
    spans.sort_by_key(|(start, end, _)| (*start, *end));

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    let mut counts = std::collections::HashMap::new();
    let mut total = 0u64;

    for (start, end, entity_type) in spans {
        if start < cursor {
            continue;
        }
        out.push_str(&text[cursor..start]);
        let span = &text[start..end];
        out.push_str(&deterministic_token(entity_type, span, salt));
        cursor = end;
        *counts.entry(entity_type.to_string()).or_insert(0u64) += 1;
        total += 1;
    }
    out.push_str(&text[cursor..]);

    (
        out,
        RedactionSummary {
            entities: counts,
            total,
            policy: Some(policy.to_string()),
        },
    )
}

fn deterministic_token(entity_type: &str, span: &str, salt: &str) -> String {
    let digest = Sha256::digest(format!("{salt}{span}").as_bytes());
    let prefix = &hex::encode(digest)[..8];
    format!("[{entity_type}_{prefix}]")
}

impl PhiDetector for PatternPhiDetector {
    async fn detect_and_mask(
        &self,
        text: &str,
        salt: &str,
    ) -> Result<PhiDetectionResult, ModelCallError> {
        let (masked, summary) = self.mask(text, salt);
        Ok(PhiDetectionResult { text: masked, summary })
    }
}

struct RedactSpec<D: PhiDetector> {
    detector: D,
    salt: String,
}

impl<D: PhiDetector> StageSpec for RedactSpec<D> {
    const STAGE: Stage = Stage::Redact;
    type Output = RedactedArtifact;

    async fn execute(
        &self,
        _run_id: &RunId,
        _input: &EnvelopeInput,
        predecessor: Option<&[u8]>,
    ) -> Result<Self::Output, StageError> {
        let bytes = predecessor.ok_or_else(|| StageError::permanent("missing transcript artifact"))?;
        let transcript: sf_domain::TranscriptArtifact = serde_json::from_slice(bytes)
            .map_err(|e| StageError::permanent(format!("transcript artifact unreadable: {e}")))?;

        if transcript.text.trim().is_empty() {
            return Err(StageError::permanent("transcript text is empty"));
        }

        let result = self
            .detector
            .detect_and_mask(&transcript.text, &self.salt)
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    StageError::retryable(e)
                } else {
                    StageError::permanent(e)
                }
            })?;

        Ok(RedactedArtifact { text: result.text, summary: result.summary })
    }
}

type Worker = StageWorker<
    RedactSpec<PatternPhiDetector>,
    S3ArtifactStore,
    PostgresStateStore,
    NatsMessageBus,
    HttpTaskQueueClient<GcpMetadataTokenMinter>,
    OidcProvider,
>;

#[derive(Debug, Clone)]
struct ServiceConfig {
    pipeline: PipelineConfig,
    bind_addr: String,
    self_base_url: String,
    queue_api_base: String,
    notification_issuers: Vec<String>,
    /// Label recorded on every `RedactionSummary.policy`, naming the
    /// detector coverage actually in force. Defaults to an honest
    /// description of the eight shipped pattern categories rather than
    /// asserting a compliance standard the recognizer doesn't implement.
    redaction_policy_label: String,
}

impl ServiceConfig {
    fn from_env() -> Self {
        Self {
            pipeline: PipelineConfig::from_env(),
            bind_addr: env_or("SF_BIND_ADDR", "0.0.0.0:8080"),
            self_base_url: require_env("SF_SELF_BASE_URL"),
            queue_api_base: require_env("SF_QUEUE_API_BASE"),
            notification_issuers: env_or("SF_NOTIFICATION_ISSUERS", "https://accounts.google.com")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            redaction_policy_label: env_or(
                "SF_REDACTION_POLICY_LABEL",
                "pattern-detector-v1:address,email,phone,ssn,date-time,medical-license,credit-card,passport",
            ),
        }
    }
}

fn router(worker: Arc<Worker>, metrics_state: MetricsState, metrics: Arc<Metrics>) -> Router {
    type W = RedactSpec<PatternPhiDetector>;
    let api = Router::new()
        .route(
            "/events/pubsub",
            post(push_receiver::<W, S3ArtifactStore, PostgresStateStore, NatsMessageBus, HttpTaskQueueClient<GcpMetadataTokenMinter>, OidcProvider>),
        )
        .route(
            "/tasks/redact",
            post(task_executor::<W, S3ArtifactStore, PostgresStateStore, NatsMessageBus, HttpTaskQueueClient<GcpMetadataTokenMinter>, OidcProvider>),
        )
        .route("/health", get(health))
        .with_state(worker);

    let metrics_router = Router::new()
        .route("/metrics", get(metrics_endpoint))
        .with_state(metrics_state);

    api.merge(metrics_router)
        .layer(axum::middleware::from_fn_with_state(metrics, metrics_middleware))
        .layer(axum::middleware::from_fn(request_context_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "stage": "redact" }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    init_tracing("sf_stage_redact", "info");

    let config = ServiceConfig::from_env();

    let pool = PostgresStateStore::connect(&config.pipeline.database_url)
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to connect to state store");
            std::process::exit(1);
        });
    pool.migrate().await.unwrap_or_else(|e| {
        error!(error = %e, "failed to run migrations");
        std::process::exit(1);
    });

    let artifacts = S3ArtifactStore::new(ObjectStoreConfig {
        bucket: config.pipeline.artifact_bucket.clone(),
        ..ObjectStoreConfig::local_dev()
    })
    .await
    .unwrap_or_else(|e| {
        error!(error = %e, "failed to initialize object store");
        std::process::exit(1);
    });

    let bus = NatsMessageBus::connect(NatsConfig {
        url: config.pipeline.nats_url.clone(),
        ..NatsConfig::local_dev()
    })
    .await
    .unwrap_or_else(|e| {
        error!(error = %e, "failed to connect to message bus");
        std::process::exit(1);
    });

    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .build()
        .expect("failed to build http client");

    let queue = HttpTaskQueueClient::new(
        TaskQueueConfig {
            queue_api_base: config.queue_api_base.clone(),
            caller_service_identity: config.pipeline.caller_service_identity.clone(),
            push_audience: config.self_base_url.clone(),
        },
        http.clone(),
        GcpMetadataTokenMinter::new(http.clone()),
    );

    let verifier = OidcProvider::new(OidcConfig::local_dev(
        config.notification_issuers.clone(),
        config.pipeline.push_audience.clone(),
        env_or("SF_JWKS_URI", "https://www.googleapis.com/oauth2/v3/certs"),
    ));
    verifier.refresh_jwks().await.unwrap_or_else(|e| {
        warn!(error = %e, "initial jwks fetch failed, will retry lazily");
    });

    let spec = RedactSpec {
        detector: PatternPhiDetector::new(config.redaction_policy_label.clone()),
        salt: config.pipeline.redaction_salt.clone(),
    };

    let worker = Arc::new(Worker::new(
        spec,
        artifacts,
        pool,
        bus,
        queue,
        verifier,
        WorkerConfig {
            push_audience: config.pipeline.push_audience.clone(),
            self_base_url: config.self_base_url.clone(),
            retry: config.pipeline.retry.clone(),
        },
    ));

    let metrics = Arc::new(Metrics::new());
    let metrics_state = MetricsState {
        service_name: "sf-stage-redact",
        metrics: metrics.clone(),
        start_time: Instant::now(),
    };

    let bind_addr = config.bind_addr.clone();
    let app = router(worker, metrics_state, metrics);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap_or_else(|e| {
        error!(error = %e, addr = %bind_addr, "failed to bind");
        std::process::exit(1);
    });

    info!(addr = %bind_addr, "sf-stage-redact listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> EnvelopeInput {
        EnvelopeInput { bucket: "bkt".into(), name: "a.wav".into(), generation: "1".into(), session: None }
    }

    fn transcript_bytes(text: &str) -> Vec<u8> {
        serde_json::to_vec(&sf_domain::TranscriptArtifact {
            text: text.to_string(),
            language: None,
            segments: vec![],
            duration: None,
            model_used: None,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn deterministic_token_is_stable_for_same_salt_and_span() {
        let a = deterministic_token("EMAIL_ADDRESS", "doe@example.com", "salt-1");
        let b = deterministic_token("EMAIL_ADDRESS", "doe@example.com", "salt-1");
        assert_eq!(a, b);
    }

    #[test]
    fn deterministic_token_changes_with_salt() {
        let a = deterministic_token("EMAIL_ADDRESS", "doe@example.com", "salt-1");
        let b = deterministic_token("EMAIL_ADDRESS", "doe@example.com", "salt-2");
        assert_ne!(a, b);
    }

    #[test]
    fn mask_replaces_email_and_phone() {
        let detector = PatternPhiDetector::new("test-policy".to_string());
        let (masked, summary) = detector.mask(
            "Contact John at doe@example.com or 555-123-4567.",
            "salt",
        );
        assert!(!masked.contains("doe@example.com"));
        assert!(!masked.contains("555-123-4567"));
        assert_eq!(summary.total, 2);
        assert_eq!(summary.entities.get("EMAIL_ADDRESS"), Some(&1));
        assert_eq!(summary.entities.get("PHONE_NUMBER"), Some(&1));
    }

    #[test]
    fn overlapping_spans_keep_only_the_outer_leftmost_one() {
        let text = "0123456789";
        // Two overlapping detections over the same text: [0,6) starts
        // first, [3,9) starts inside it and must be dropped.
        let spans = vec![(0usize, 6usize, "A"), (3usize, 9usize, "B")];
        let (masked, summary) = apply_deterministic_mask(text, spans, "salt", "test-policy");
        assert_eq!(summary.total, 1);
        assert!(masked.contains("[A_"));
        assert!(!masked.contains("[B_"));
    }

    #[test]
    fn output_length_is_monotone_in_non_overlapping_detection_count() {
        let text = "aaaaaaaaaa";
        let one = apply_deterministic_mask(text, vec![(0, 2, "A")], "salt", "test-policy").0;
        let two = apply_deterministic_mask(text, vec![(0, 2, "A"), (4, 6, "A")], "salt", "test-policy").0;
        assert!(two.len() > one.len());
    }

    #[tokio::test]
    async fn execute_masks_transcript_text_deterministically() {
        let spec = RedactSpec { detector: PatternPhiDetector::new("test-policy".to_string()), salt: "fixed-salt".to_string() };
        let run_id = RunId::from_hex("run-1");
        let bytes = transcript_bytes("Email doe@example.com for records.");

        let out_a = spec.execute(&run_id, &sample_input(), Some(&bytes)).await.unwrap();
        let out_b = spec.execute(&run_id, &sample_input(), Some(&bytes)).await.unwrap();
        assert_eq!(out_a.text, out_b.text);
        assert!(!out_a.text.contains("doe@example.com"));
    }

    #[tokio::test]
    async fn missing_predecessor_is_permanent() {
        let spec = RedactSpec { detector: PatternPhiDetector::new("test-policy".to_string()), salt: "salt".to_string() };
        let run_id = RunId::from_hex("run-1");
        let err = spec.execute(&run_id, &sample_input(), None).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn empty_transcript_text_is_permanent() {
        let spec = RedactSpec { detector: PatternPhiDetector::new("test-policy".to_string()), salt: "salt".to_string() };
        let run_id = RunId::from_hex("run-1");
        let bytes = transcript_bytes("   ");
        let err = spec.execute(&run_id, &sample_input(), Some(&bytes)).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
