//! Audit stage worker: calls a JSON-mode compliance-judging LLM over
//! the redacted transcript and derives the HIPAA pass/fail verdict that
//! branches the orchestrator to either `soap.requested` or a finalized
//! FAIL run.

use axum::{routing::get, routing::post, Json, Router};
use sf_auth::{GcpMetadataTokenMinter, OidcConfig, OidcProvider};
use sf_config::{env_or, require_env, PipelineConfig};
use sf_domain::{
    AuditArtifact, ComplianceJudge, ContentPreview, EnvelopeInput, ModelCallError, RunId, Stage,
    StageError,
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
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// JSON-mode compliance judge. The concrete LLM backend is an external
/// collaborator; this type owns only the HTTP call, the one in-call
/// retry on a non-JSON or schema-invalid response, and the
/// response-shape validation — a second bad response escalates to
/// `PermanentError`.
struct HttpComplianceJudge {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpComplianceJudge {
    async fn call_once(&self, redacted_transcript: &str) -> Result<AuditArtifact, ModelCallError> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            transcript: &'a str,
        }

        let response = self
            .http
            .post(&self.endpoint)
            .json(&Req { transcript: redacted_transcript })
            .send()
            .await
            .map_err(|_| ModelCallError::Timeout)?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelCallError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(ModelCallError::UpstreamStatus { status: response.status().as_u16() });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelCallError::InvalidResponse(format!("non-JSON audit response: {e}")))?;

        parse_audit_response(&body)
    }
}

/// Validates the strict compliance-judge response shape: `hipaa_compliant`
/// must be boolean, `fail_identifiers` an array of `{type,text,position}`
/// objects, `comments` a string. Anything else is a schema violation.
fn parse_audit_response(body: &serde_json::Value) -> Result<AuditArtifact, ModelCallError> {
    let obj = body
        .as_object()
        .ok_or_else(|| ModelCallError::InvalidResponse("audit response must be a JSON object".into()))?;

    let hipaa_compliant = obj
        .get("hipaa_compliant")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| ModelCallError::InvalidResponse("hipaa_compliant must be boolean".into()))?;

    let fail_identifiers_raw = obj
        .get("fail_identifiers")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ModelCallError::InvalidResponse("fail_identifiers must be an array".into()))?;

    let mut fail_identifiers = Vec::with_capacity(fail_identifiers_raw.len());
    for item in fail_identifiers_raw {
        let identifier_type = item
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ModelCallError::InvalidResponse("fail_identifiers item missing type".into()))?;
        let text = item
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ModelCallError::InvalidResponse("fail_identifiers item missing text".into()))?;
        let position = item
            .get("position")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ModelCallError::InvalidResponse("fail_identifiers item missing position".into()))?;
        fail_identifiers.push(sf_domain::FailIdentifier {
            identifier_type: identifier_type.to_string(),
            text: text.to_string(),
            position: position.to_string(),
        });
    }

    let comments = obj
        .get("comments")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(AuditArtifact {
        hipaa_compliant,
        fail_identifiers,
        comments,
        // Boolean is authoritative regardless of `fail_identifiers` cardinality.
        hipaa_pass: hipaa_compliant,
    })
}

impl ComplianceJudge for HttpComplianceJudge {
    async fn judge(&self, redacted_transcript: &str) -> Result<AuditArtifact, ModelCallError> {
        match self.call_once(redacted_transcript).await {
            Ok(artifact) => Ok(artifact),
            Err(e) if e.is_retryable() => Err(e),
            Err(first_err) => {
                warn!(
                    error_preview = %ContentPreview::of(&first_err.to_string()),
                    "audit response invalid, retrying once in-call"
                );
                self.call_once(redacted_transcript).await.map_err(|second_err| {
                    if second_err.is_retryable() {
                        second_err
                    } else {
                        ModelCallError::InvalidResponse(format!(
                            "audit response invalid after retry: {second_err}"
                        ))
                    }
                })
            }
        }
    }
}

struct AuditSpec<J: ComplianceJudge> {
    judge: J,
}

impl<J: ComplianceJudge> StageSpec for AuditSpec<J> {
    const STAGE: Stage = Stage::Audit;
    type Output = AuditArtifact;

    async fn execute(
        &self,
        _run_id: &RunId,
        _input: &EnvelopeInput,
        predecessor: Option<&[u8]>,
    ) -> Result<Self::Output, StageError> {
        let bytes = predecessor.ok_or_else(|| StageError::permanent("missing redacted artifact"))?;
        let redacted: sf_domain::RedactedArtifact = serde_json::from_slice(bytes)
            .map_err(|e| StageError::permanent(format!("redacted artifact unreadable: {e}")))?;

        if redacted.text.trim().is_empty() {
            return Err(StageError::permanent("redacted text is empty"));
        }

        let mut artifact = self.judge.judge(&redacted.text).await.map_err(|e| {
            if e.is_retryable() {
                StageError::retryable(e)
            } else {
                StageError::permanent(e)
            }
        })?;
        artifact.hipaa_pass = artifact.hipaa_compliant;
        Ok(artifact)
    }

    fn completion_summary(&self, output: &Self::Output) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("hipaa_pass".to_string(), serde_json::Value::Bool(output.hipaa_pass));
        map
    }
}

type Worker = StageWorker<
    AuditSpec<HttpComplianceJudge>,
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
    audit_endpoint: String,
    queue_api_base: String,
    notification_issuers: Vec<String>,
}

impl ServiceConfig {
    fn from_env() -> Self {
        Self {
            pipeline: PipelineConfig::from_env(),
            bind_addr: env_or("SF_BIND_ADDR", "0.0.0.0:8080"),
            self_base_url: require_env("SF_SELF_BASE_URL"),
            audit_endpoint: require_env("SF_AUDIT_ENDPOINT"),
            queue_api_base: require_env("SF_QUEUE_API_BASE"),
            notification_issuers: env_or("SF_NOTIFICATION_ISSUERS", "https://accounts.google.com")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        }
    }
}

fn router(worker: Arc<Worker>, metrics_state: MetricsState, metrics: Arc<Metrics>) -> Router {
    type W = AuditSpec<HttpComplianceJudge>;
    let api = Router::new()
        .route(
            "/events/pubsub",
            post(push_receiver::<W, S3ArtifactStore, PostgresStateStore, NatsMessageBus, HttpTaskQueueClient<GcpMetadataTokenMinter>, OidcProvider>),
        )
        .route(
            "/tasks/audit",
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
    Json(serde_json::json!({ "status": "ok", "stage": "audit" }))
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
    init_tracing("sf_stage_audit", "info");

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

    let spec = AuditSpec {
        judge: HttpComplianceJudge { http: http.clone(), endpoint: config.audit_endpoint.clone() },
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
        service_name: "sf-stage-audit",
        metrics: metrics.clone(),
        start_time: Instant::now(),
    };

    let bind_addr = config.bind_addr.clone();
    let app = router(worker, metrics_state, metrics);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap_or_else(|e| {
        error!(error = %e, addr = %bind_addr, "failed to bind");
        std::process::exit(1);
    });

    info!(addr = %bind_addr, "sf-stage-audit listening");
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

    fn redacted_bytes(text: &str) -> Vec<u8> {
        serde_json::to_vec(&sf_domain::RedactedArtifact {
            text: text.to_string(),
            summary: sf_domain::RedactionSummary::default(),
        })
        .unwrap()
    }

    struct StubJudge(std::sync::Mutex<Vec<Result<AuditArtifact, ModelCallError>>>);

    impl StubJudge {
        fn once(result: Result<AuditArtifact, ModelCallError>) -> Self {
            Self(std::sync::Mutex::new(vec![result]))
        }
    }

    impl ComplianceJudge for StubJudge {
        async fn judge(&self, _redacted_transcript: &str) -> Result<AuditArtifact, ModelCallError> {
            self.0.lock().unwrap().remove(0)
        }
    }

    fn compliant_artifact() -> AuditArtifact {
        AuditArtifact { hipaa_compliant: true, fail_identifiers: vec![], comments: String::new(), hipaa_pass: true }
    }

    #[test]
    fn parse_audit_response_sets_hipaa_pass_from_boolean() {
        let body = serde_json::json!({
            "hipaa_compliant": false,
            "fail_identifiers": [{"type": "name", "text": "[NAME_abc12345]", "position": "seg 1"}],
            "comments": "patient name leaked"
        });
        let parsed = parse_audit_response(&body).unwrap();
        assert!(!parsed.hipaa_pass);
        assert_eq!(parsed.fail_identifiers.len(), 1);
    }

    #[test]
    fn parse_audit_response_rejects_missing_hipaa_compliant() {
        let body = serde_json::json!({ "fail_identifiers": [], "comments": "" });
        assert!(parse_audit_response(&body).is_err());
    }

    #[test]
    fn hipaa_pass_is_authoritative_even_with_empty_fail_identifiers() {
        // hipaa_pass tracks the boolean regardless of fail_identifiers length.
        let body = serde_json::json!({
            "hipaa_compliant": false,
            "fail_identifiers": [],
            "comments": "policy violation not tied to a specific span"
        });
        let parsed = parse_audit_response(&body).unwrap();
        assert!(!parsed.hipaa_pass);
    }

    #[tokio::test]
    async fn execute_derives_hipaa_pass_from_hipaa_compliant() {
        let spec = AuditSpec { judge: StubJudge::once(Ok(compliant_artifact())) };
        let run_id = RunId::from_hex("run-1");
        let bytes = redacted_bytes("clean text");
        let out = spec.execute(&run_id, &sample_input(), Some(&bytes)).await.unwrap();
        assert!(out.hipaa_pass);
    }

    #[tokio::test]
    async fn missing_predecessor_is_permanent() {
        let spec = AuditSpec { judge: StubJudge::once(Ok(compliant_artifact())) };
        let run_id = RunId::from_hex("run-1");
        let err = spec.execute(&run_id, &sample_input(), None).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn judge_timeout_is_retryable() {
        let spec = AuditSpec { judge: StubJudge::once(Err(ModelCallError::Timeout)) };
        let run_id = RunId::from_hex("run-1");
        let bytes = redacted_bytes("text");
        let err = spec.execute(&run_id, &sample_input(), Some(&bytes)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn completion_summary_carries_hipaa_pass() {
        let spec = AuditSpec { judge: StubJudge::once(Ok(compliant_artifact())) };
        let summary = spec.completion_summary(&compliant_artifact());
        assert_eq!(summary.get("hipaa_pass"), Some(&serde_json::Value::Bool(true)));
        let _ = spec;
    }
}
