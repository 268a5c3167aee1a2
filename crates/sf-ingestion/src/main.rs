//! Ingestion gateway: turns object-upload push notifications into
//! deduplicated pipeline runs.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sf_auth::{GcpMetadataTokenMinter, IdentityTokenCache, OidcConfig, OidcProvider};
use sf_config::{env_or, env_or_parse, require_env, PipelineConfig};
use sf_domain::{EnvelopeInput, IdempotencyKey, InputRef, PushEnvelope};
use sf_observability::{
    init_tracing, metrics_endpoint, metrics_middleware, request_context_middleware,
    ExtractRequestContext, Metrics, MetricsState,
};
use sf_ports::{IdentityVerifier, IngestionUpsertOutcome, StateStore};
use sf_store_postgres::PostgresStateStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
struct IngestionConfig {
    pipeline: PipelineConfig,
    bind_addr: String,
    orchestrator_url: String,
    orch_concurrency: usize,
    notification_issuers: Vec<String>,
}

impl IngestionConfig {
    fn from_env() -> Self {
        Self {
            pipeline: PipelineConfig::from_env(),
            bind_addr: env_or("SF_BIND_ADDR", "0.0.0.0:8080"),
            orchestrator_url: require_env("SF_ORCHESTRATOR_URL"),
            orch_concurrency: env_or_parse("SF_ORCH_CONCURRENCY", 64),
            notification_issuers: env_or("SF_NOTIFICATION_ISSUERS", "https://accounts.google.com")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        }
    }
}

struct AppState {
    state: PostgresStateStore,
    http: reqwest::Client,
    tokens: IdentityTokenCache<GcpMetadataTokenMinter>,
    verifier: OidcProvider,
    semaphore: Arc<Semaphore>,
    config: IngestionConfig,
    metrics: Arc<Metrics>,
}

#[derive(Debug, thiserror::Error)]
enum IngestError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("malformed notification: {0}")]
    Malformed(String),
    #[error("state store error: {0}")]
    Store(String),
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match self {
            IngestError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
            IngestError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    bucket: &'a str,
    name: &'a str,
    generation: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    correlation_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    #[allow(dead_code)]
    run_id: String,
    #[allow(dead_code)]
    created: bool,
}

#[instrument(skip_all)]
async fn pubsub_push(
    State(app): State<Arc<AppState>>,
    ExtractRequestContext(ctx): ExtractRequestContext,
    headers: HeaderMap,
    Json(push): Json<PushEnvelope>,
) -> Result<StatusCode, IngestError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| IngestError::Unauthorized("missing bearer token".to_string()))?;
    app.verifier
        .verify(token, &app.config.pipeline.push_audience)
        .await
        .map_err(|e| IngestError::Unauthorized(e.to_string()))?;

    let envelope: EnvelopeInput = push
        .decode()
        .map_err(|e| IngestError::Malformed(e.to_string()))?;

    if envelope.bucket.is_empty() || envelope.name.is_empty() {
        return Err(IngestError::Malformed(
            "bucket and name are required".to_string(),
        ));
    }

    let input = InputRef::new(
        envelope.bucket.clone(),
        envelope.name.clone(),
        envelope.generation.clone(),
        envelope.session.clone(),
    );
    let idem_key = IdempotencyKey::from_input(&input);
    let now = Utc::now();

    let outcome = app
        .state
        .upsert_ingestion(&idem_key, now, app.config.pipeline.idempotency_ttl_days)
        .await
        .map_err(|e| {
            warn!(error = %e, "ingestion upsert failed");
            IngestError::Store(e.to_string())
        })?;

    if let IngestionUpsertOutcome::Duplicate = outcome {
        info!(idempotency_key = %idem_key, "duplicate notification, acking without dispatch");
        return Ok(StatusCode::NO_CONTENT);
    }

    let _permit = app.semaphore.acquire().await.expect("semaphore not closed");

    let body = CreateRunRequest {
        bucket: &envelope.bucket,
        name: &envelope.name,
        generation: &envelope.generation,
        session: envelope.session.as_deref(),
        correlation_id: &ctx.correlation_id,
    };

    let bearer = app
        .tokens
        .get(&app.config.orchestrator_url)
        .await
        .map_err(|e| IngestError::Store(e.to_string()))?;

    let dispatch_start = Instant::now();
    let response = app
        .http
        .post(format!("{}/run", app.config.orchestrator_url))
        .bearer_auth(bearer)
        .header("x-correlation-id", &ctx.correlation_id)
        .json(&body)
        .send()
        .await;

    let now = Utc::now();
    match response {
        Ok(resp) if resp.status().is_success() => {
            let _: CreateRunResponse = resp.json().await.unwrap_or(CreateRunResponse {
                run_id: String::new(),
                created: false,
            });
            if let Err(e) = app.state.mark_ingestion_done(&idem_key, now).await {
                error!(error = %e, "failed to mark ingestion done after orchestrator success");
            }
            info!(
                elapsed_ms = dispatch_start.elapsed().as_millis() as u64,
                "run dispatched to orchestrator"
            );
            Ok(StatusCode::NO_CONTENT)
        }
        Ok(resp) if resp.status().is_client_error() => {
            let detail = resp.status().to_string();
            if let Err(e) = app
                .state
                .mark_ingestion_failed(&idem_key, now, true, &detail)
                .await
            {
                error!(error = %e, "failed to mark ingestion permanently failed");
            }
            warn!(status = %detail, "orchestrator rejected run permanently");
            Ok(StatusCode::NO_CONTENT)
        }
        Ok(resp) => {
            let detail = resp.status().to_string();
            if let Err(e) = app
                .state
                .mark_ingestion_failed(&idem_key, now, false, &detail)
                .await
            {
                error!(error = %e, "failed to mark ingestion transiently failed");
            }
            warn!(status = %detail, "orchestrator returned a retryable error");
            Ok(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(e) => {
            if let Err(store_err) = app
                .state
                .mark_ingestion_failed(&idem_key, now, false, &e.to_string())
                .await
            {
                error!(error = %store_err, "failed to mark ingestion transiently failed");
            }
            warn!(error = %e, "orchestrator call failed transiently");
            Ok(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn router(app_state: Arc<AppState>, metrics_state: MetricsState, metrics: Arc<Metrics>) -> Router {
    let api = Router::new()
        .route("/pubsub/push", post(pubsub_push))
        .route("/health", get(health))
        .with_state(app_state);

    let metrics_router = Router::new()
        .route("/metrics", get(metrics_endpoint))
        .with_state(metrics_state);

    api.merge(metrics_router)
        .layer(axum::middleware::from_fn_with_state(metrics, metrics_middleware))
        .layer(axum::middleware::from_fn(request_context_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
    init_tracing("sf_ingestion", "info");

    let config = IngestionConfig::from_env();
    let pool = sf_store_postgres::PostgresStateStore::connect(&config.pipeline.database_url)
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to connect to state store");
            std::process::exit(1);
        });
    pool.migrate().await.unwrap_or_else(|e| {
        error!(error = %e, "failed to run migrations");
        std::process::exit(1);
    });

    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .build()
        .expect("failed to build http client");

    let verifier = OidcProvider::new(OidcConfig::local_dev(
        config.notification_issuers.clone(),
        config.pipeline.push_audience.clone(),
        env_or("SF_JWKS_URI", "https://www.googleapis.com/oauth2/v3/certs"),
    ));
    verifier.refresh_jwks().await.unwrap_or_else(|e| {
        warn!(error = %e, "initial jwks fetch failed, will retry lazily");
    });

    let metrics = Arc::new(Metrics::new());
    let metrics_state = MetricsState {
        service_name: "sf-ingestion",
        metrics: metrics.clone(),
        start_time: Instant::now(),
    };

    let app_state = Arc::new(AppState {
        semaphore: Arc::new(Semaphore::new(config.orch_concurrency)),
        tokens: IdentityTokenCache::new(GcpMetadataTokenMinter::new(http.clone())),
        state: pool,
        http,
        verifier,
        metrics: metrics.clone(),
        config,
    });

    let bind_addr = app_state.config.bind_addr.clone();
    let app = router(app_state, metrics_state, metrics);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, addr = %bind_addr, "failed to bind");
            std::process::exit(1);
        });

    info!(addr = %bind_addr, "sf-ingestion listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}
