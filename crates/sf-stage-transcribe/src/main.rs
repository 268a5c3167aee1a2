//! Transcribe stage worker: speech-to-text over the uploaded audio
//! object referenced by the run's input, the first stage in the
//! pipeline and the only one with no predecessor artifact.

use axum::{routing::get, routing::post, Json, Router};
use chrono::Utc;
use sf_auth::{GcpMetadataTokenMinter, OidcConfig, OidcProvider};
use sf_config::{env_or, require_env, PipelineConfig};
use sf_domain::{
    model_ports::TranscriptionResult, EnvelopeInput, ModelCallError, RunId, SpeechToText, Stage,
    StageError, TranscriptArtifact,
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

/// Speech-to-text backend call. The concrete transcription service is
/// an external collaborator; only the port boundary and its error
/// classification live here.
struct HttpSpeechToText {
    http: reqwest::Client,
    endpoint: String,
}

impl SpeechToText for HttpSpeechToText {
    async fn transcribe(
        &self,
        audio_bucket: &str,
        audio_name: &str,
        language_hint: Option<&str>,
    ) -> Result<TranscriptionResult, ModelCallError> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            bucket: &'a str,
            name: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            language_hint: Option<&'a str>,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            text: String,
            language: Option<String>,
            #[serde(default)]
            segments: Vec<sf_domain::TranscriptSegment>,
            duration: Option<f64>,
            model_used: Option<String>,
        }

        let response = self
            .http
            .post(&self.endpoint)
            .json(&Req { bucket: audio_bucket, name: audio_name, language_hint })
            .send()
            .await
            .map_err(|_| ModelCallError::Timeout)?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelCallError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(ModelCallError::UpstreamStatus { status: response.status().as_u16() });
        }

        let body: Resp = response
            .json()
            .await
            .map_err(|e| ModelCallError::InvalidResponse(e.to_string()))?;

        Ok(TranscriptionResult {
            text: body.text,
            language: body.language,
            segments: body.segments,
            duration: body.duration,
            model_used: body.model_used,
        })
    }
}

/// Generic over its `SpeechToText` backend so the stage's business
/// logic can be exercised against a deterministic stub in tests without
/// touching the live HTTP client.
struct TranscribeSpec<T: SpeechToText> {
    stt: T,
}

impl<T: SpeechToText> StageSpec for TranscribeSpec<T> {
    const STAGE: Stage = Stage::Transcribe;
    type Output = TranscriptArtifact;

    async fn execute(
        &self,
        _run_id: &RunId,
        input: &EnvelopeInput,
        _predecessor: Option<&[u8]>,
    ) -> Result<Self::Output, StageError> {
        let result = self.stt.transcribe(&input.bucket, &input.name, None).await.map_err(|e| {
            if e.is_retryable() {
                StageError::retryable(e)
            } else {
                StageError::permanent(e)
            }
        })?;

        Ok(TranscriptArtifact {
            text: result.text,
            language: result.language,
            segments: result.segments,
            duration: result.duration,
            model_used: result.model_used,
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    fn validate(&self, output: &Self::Output) -> Result<(), StageError> {
        if output.text.trim().is_empty() {
            return Err(StageError::permanent("transcript text is empty"));
        }
        Ok(())
    }
}

type Worker = StageWorker<
    TranscribeSpec<HttpSpeechToText>,
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
    stt_endpoint: String,
    queue_api_base: String,
    notification_issuers: Vec<String>,
}

impl ServiceConfig {
    fn from_env() -> Self {
        Self {
            pipeline: PipelineConfig::from_env(),
            bind_addr: env_or("SF_BIND_ADDR", "0.0.0.0:8080"),
            self_base_url: require_env("SF_SELF_BASE_URL"),
            stt_endpoint: require_env("SF_STT_ENDPOINT"),
            queue_api_base: require_env("SF_QUEUE_API_BASE"),
            notification_issuers: env_or("SF_NOTIFICATION_ISSUERS", "https://accounts.google.com")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        }
    }
}

fn router(worker: Arc<Worker>, metrics_state: MetricsState, metrics: Arc<Metrics>) -> Router {
    type W = TranscribeSpec<HttpSpeechToText>;
    let api = Router::new()
        .route(
            "/events/pubsub",
            post(push_receiver::<W, S3ArtifactStore, PostgresStateStore, NatsMessageBus, HttpTaskQueueClient<GcpMetadataTokenMinter>, OidcProvider>),
        )
        .route(
            "/tasks/transcribe",
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
    Json(serde_json::json!({ "status": "ok", "stage": "transcribe" }))
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
    init_tracing("sf_stage_transcribe", "info");

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

    let spec = TranscribeSpec {
        stt: HttpSpeechToText { http: http.clone(), endpoint: config.stt_endpoint.clone() },
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
        service_name: "sf-stage-transcribe",
        metrics: metrics.clone(),
        start_time: Instant::now(),
    };

    let bind_addr = config.bind_addr.clone();
    let app = router(worker, metrics_state, metrics);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap_or_else(|e| {
        error!(error = %e, addr = %bind_addr, "failed to bind");
        std::process::exit(1);
    });

    info!(addr = %bind_addr, "sf-stage-transcribe listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubStt(Result<TranscriptionResult, ModelCallError>);

    impl SpeechToText for StubStt {
        async fn transcribe(
            &self,
            _audio_bucket: &str,
            _audio_name: &str,
            _language_hint: Option<&str>,
        ) -> Result<TranscriptionResult, ModelCallError> {
            self.0.clone()
        }
    }

    fn sample_input() -> EnvelopeInput {
        EnvelopeInput { bucket: "bkt".into(), name: "a.wav".into(), generation: "1".into(), session: None }
    }

    #[tokio::test]
    async fn execute_maps_transcription_result_to_artifact() {
        let spec = TranscribeSpec {
            stt: StubStt(Ok(TranscriptionResult {
                text: "hello doctor".into(),
                language: Some("en".into()),
                segments: vec![],
                duration: Some(3.2),
                model_used: Some("whisper-test".into()),
            })),
        };
        let run_id = RunId::from_hex("run-1");
        let out = spec.execute(&run_id, &sample_input(), None).await.unwrap();
        assert_eq!(out.text, "hello doctor");
        assert_eq!(out.language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn empty_transcript_fails_validation() {
        let spec = TranscribeSpec {
            stt: StubStt(Ok(TranscriptionResult {
                text: "   ".into(),
                language: None,
                segments: vec![],
                duration: None,
                model_used: None,
            })),
        };
        let run_id = RunId::from_hex("run-1");
        let out = spec.execute(&run_id, &sample_input(), None).await.unwrap();
        assert!(spec.validate(&out).is_err());
    }

    #[tokio::test]
    async fn upstream_500_is_retryable() {
        let spec = TranscribeSpec { stt: StubStt(Err(ModelCallError::UpstreamStatus { status: 503 })) };
        let run_id = RunId::from_hex("run-1");
        let err = spec.execute(&run_id, &sample_input(), None).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn schema_invalid_response_is_permanent() {
        let spec = TranscribeSpec { stt: StubStt(Err(ModelCallError::InvalidResponse("not json".into()))) };
        let run_id = RunId::from_hex("run-1");
        let err = spec.execute(&run_id, &sample_input(), None).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
