//! SOAP stage worker: generates a clinical SOAP note from the redacted
//! transcript text and enforces that the four headings appear, in
//! order, inside the `<soap_note>...</soap_note>` wrapper before the
//! artifact is accepted.

use axum::{routing::get, routing::post, Json, Router};
use sf_auth::{GcpMetadataTokenMinter, OidcConfig, OidcProvider};
use sf_config::{env_or, require_env, PipelineConfig};
use sf_domain::{EnvelopeInput, ModelCallError, NoteGenerator, RunId, SoapArtifact, Stage, StageError};
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

/// Ordered heading markers a well-formed SOAP note must contain.
const REQUIRED_HEADINGS: [&str; 4] = ["Subjective", "Objective", "Assessment", "Plan"];

/// Calls an OpenAI-compatible chat-completions endpoint in JSON mode and
/// extracts the `soap_note` field verbatim; the model's response value
/// already carries the `<soap_note>...</soap_note>` wrapper per the
/// upstream contract, so this port hands it back unmodified.
struct HttpNoteGenerator {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    system_prompt: String,
}

impl NoteGenerator for HttpNoteGenerator {
    async fn generate(
        &self,
        redacted_transcript: &str,
        language: Option<&str>,
    ) -> Result<String, ModelCallError> {
        #[derive(serde::Serialize)]
        struct Message<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(serde::Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Message<'a>>,
            temperature: f32,
            language: Option<&'a str>,
        }

        let response = self
            .http
            .post(&self.endpoint)
            .json(&Req {
                model: &self.model,
                messages: vec![
                    Message { role: "system", content: &self.system_prompt },
                    Message { role: "user", content: redacted_transcript },
                ],
                temperature: 0.4,
                language,
            })
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
            .map_err(|e| ModelCallError::InvalidResponse(format!("non-JSON soap response: {e}")))?;

        body.get("soap_note")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ModelCallError::InvalidResponse("soap response missing soap_note".into()))
    }
}

/// Checks that the four SOAP headings appear, in order, inside the
/// `<soap_note>...</soap_note>` wrapper. A missing or out-of-order
/// heading is a schema violation, not a model-call failure — the
/// response was well-formed JSON, just clinically malformed content.
fn headings_in_order(wrapped: &str) -> bool {
    let inner = wrapped
        .strip_prefix("<soap_note>")
        .and_then(|s| s.strip_suffix("</soap_note>"))
        .unwrap_or(wrapped);

    let mut cursor = 0usize;
    for heading in REQUIRED_HEADINGS {
        match inner[cursor..].find(heading) {
            Some(offset) => cursor += offset + heading.len(),
            None => return false,
        }
    }
    true
}

struct SoapSpec<N: NoteGenerator> {
    generator: N,
}

impl<N: NoteGenerator> StageSpec for SoapSpec<N> {
    const STAGE: Stage = Stage::Soap;
    type Output = SoapArtifact;

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

        let soap_note = self.generator.generate(&redacted.text, None).await.map_err(|e| {
            if e.is_retryable() {
                StageError::retryable(e)
            } else {
                StageError::permanent(e)
            }
        })?;

        Ok(SoapArtifact { soap_note })
    }

    fn validate(&self, output: &Self::Output) -> Result<(), StageError> {
        if !headings_in_order(&output.soap_note) {
            return Err(StageError::permanent(
                "soap note missing required headings in order: Subjective, Objective, Assessment, Plan",
            ));
        }
        Ok(())
    }
}

type Worker = StageWorker<
    SoapSpec<HttpNoteGenerator>,
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
    soap_endpoint: String,
    soap_model: String,
    queue_api_base: String,
    notification_issuers: Vec<String>,
}

impl ServiceConfig {
    fn from_env() -> Self {
        Self {
            pipeline: PipelineConfig::from_env(),
            bind_addr: env_or("SF_BIND_ADDR", "0.0.0.0:8080"),
            self_base_url: require_env("SF_SELF_BASE_URL"),
            soap_endpoint: require_env("SF_SOAP_ENDPOINT"),
            soap_model: env_or("SF_SOAP_MODEL", "gpt-oss"),
            queue_api_base: require_env("SF_QUEUE_API_BASE"),
            notification_issuers: env_or("SF_NOTIFICATION_ISSUERS", "https://accounts.google.com")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        }
    }
}

fn router(worker: Arc<Worker>, metrics_state: MetricsState, metrics: Arc<Metrics>) -> Router {
    type W = SoapSpec<HttpNoteGenerator>;
    let api = Router::new()
        .route(
            "/events/pubsub",
            post(push_receiver::<W, S3ArtifactStore, PostgresStateStore, NatsMessageBus, HttpTaskQueueClient<GcpMetadataTokenMinter>, OidcProvider>),
        )
        .route(
            "/tasks/soap",
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
    Json(serde_json::json!({ "status": "ok", "stage": "soap" }))
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

const SYSTEM_PROMPT: &str = "You are a clinical scribe. Produce a SOAP note from the transcript, \
wrapped as {\"soap_note\": \"<soap_note>...</soap_note>\"}, with Subjective, Objective, Assessment \
and Plan sections in that order.";

#[tokio::main]
async fn main() {
    init_tracing("sf_stage_soap", "info");

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

    let spec = SoapSpec {
        generator: HttpNoteGenerator {
            http: http.clone(),
            endpoint: config.soap_endpoint.clone(),
            model: config.soap_model.clone(),
            system_prompt: SYSTEM_PROMPT.to_string(),
        },
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
        service_name: "sf-stage-soap",
        metrics: metrics.clone(),
        start_time: Instant::now(),
    };

    let bind_addr = config.bind_addr.clone();
    let app = router(worker, metrics_state, metrics);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap_or_else(|e| {
        error!(error = %e, addr = %bind_addr, "failed to bind");
        std::process::exit(1);
    });

    info!(addr = %bind_addr, "sf-stage-soap listening");
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

    struct StubGenerator(std::sync::Mutex<Vec<Result<String, ModelCallError>>>);

    impl StubGenerator {
        fn once(result: Result<String, ModelCallError>) -> Self {
            Self(std::sync::Mutex::new(vec![result]))
        }
    }

    impl NoteGenerator for StubGenerator {
        async fn generate(&self, _text: &str, _language: Option<&str>) -> Result<String, ModelCallError> {
            self.0.lock().unwrap().remove(0)
        }
    }

    fn wrapped_note() -> String {
        "<soap_note>Subjective: pt reports pain. Objective: vitals stable. \
Assessment: stable. Plan: follow up in 2 weeks.</soap_note>"
            .to_string()
    }

    #[test]
    fn headings_in_order_accepts_well_formed_note() {
        assert!(headings_in_order(&wrapped_note()));
    }

    #[test]
    fn headings_in_order_rejects_missing_heading() {
        let note = "<soap_note>Subjective: x. Objective: y. Plan: z.</soap_note>";
        assert!(!headings_in_order(note));
    }

    #[test]
    fn headings_in_order_rejects_out_of_order_headings() {
        let note = "<soap_note>Objective: y. Subjective: x. Assessment: a. Plan: z.</soap_note>";
        assert!(!headings_in_order(note));
    }

    #[tokio::test]
    async fn execute_wraps_generator_output_into_artifact() {
        let spec = SoapSpec { generator: StubGenerator::once(Ok(wrapped_note())) };
        let run_id = RunId::from_hex("run-1");
        let bytes = redacted_bytes("clean redacted text");
        let out = spec.execute(&run_id, &sample_input(), Some(&bytes)).await.unwrap();
        assert!(spec.validate(&out).is_ok());
    }

    #[tokio::test]
    async fn validate_rejects_malformed_note() {
        let spec = SoapSpec { generator: StubGenerator::once(Ok("<soap_note>no headings here</soap_note>".into())) };
        let run_id = RunId::from_hex("run-1");
        let bytes = redacted_bytes("clean redacted text");
        let out = spec.execute(&run_id, &sample_input(), Some(&bytes)).await.unwrap();
        assert!(spec.validate(&out).is_err());
    }

    #[tokio::test]
    async fn missing_predecessor_is_permanent() {
        let spec = SoapSpec { generator: StubGenerator::once(Ok(wrapped_note())) };
        let run_id = RunId::from_hex("run-1");
        let err = spec.execute(&run_id, &sample_input(), None).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn generator_timeout_is_retryable() {
        let spec = SoapSpec { generator: StubGenerator::once(Err(ModelCallError::Timeout)) };
        let run_id = RunId::from_hex("run-1");
        let bytes = redacted_bytes("text");
        let err = spec.execute(&run_id, &sample_input(), Some(&bytes)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
