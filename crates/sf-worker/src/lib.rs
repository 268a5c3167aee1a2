//! Generic stage-worker skeleton: every stage service (`sf-stage-*`)
//! instantiates `StageWorker<S, ...>` with its own `StageSpec` and
//! mounts `push_receiver` at `/events/pubsub` and `task_executor` at
//! `/tasks/<stage>`.
//!
//! The port traits in `sf-ports` return `impl Future` (native
//! async-fn-in-trait), which is not object-safe, so this worker is
//! generic over its collaborators rather than holding `Arc<dyn Trait>`.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use rand::Rng;
use sf_config::RetryConfig;
use sf_domain::{
    ContentPreview, EnvelopeInput, EventEnvelope, EventType, PushEnvelope, RunId, Stage,
    StageError,
};
use sf_ports::{
    ArtifactStore, ArtifactStoreError, IdentityError, IdentityVerifier, MessageBus,
    MessageBusError, StateStore, TaskEnqueueOutcome, TaskQueueClient, TaskQueueError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Per-stage business logic plugged into the shared skeleton. `Output`
/// is the stage's artifact shape; the worker serializes/deserializes it
/// at the object-store boundary so `execute` only deals with typed
/// values.
pub trait StageSpec: Send + Sync + 'static {
    const STAGE: Stage;
    type Output: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static;

    /// The stage whose artifact this stage reads as input, if any.
    /// `None` for `Transcribe`, whose input is the raw uploaded object
    /// referenced by the envelope, not a prior stage's artifact.
    fn predecessor() -> Option<Stage> {
        match Self::STAGE {
            Stage::Transcribe => None,
            Stage::Redact => Some(Stage::Transcribe),
            Stage::Audit => Some(Stage::Redact),
            // SOAP note generation works from the redacted text, not
            // the audit verdict, even though Audit runs immediately
            // before it in the pipeline.
            Stage::Soap => Some(Stage::Redact),
        }
    }

    fn execute(
        &self,
        run_id: &RunId,
        input: &EnvelopeInput,
        predecessor_artifact: Option<&[u8]>,
    ) -> impl Future<Output = Result<Self::Output, StageError>> + Send;

    /// Schema-level validation beyond what `Output`'s type already
    /// guarantees (e.g. SOAP's heading-order check). Default is a
    /// no-op for stages whose type shape is the whole contract.
    fn validate(&self, _output: &Self::Output) -> Result<(), StageError> {
        Ok(())
    }

    /// Small summary fields folded into the `*.completed` envelope's
    /// `artifacts` map alongside `cache_key`/`<stage>_uri`, e.g.
    /// audit's `hipaa_pass`. Default contributes nothing extra.
    fn completion_summary(&self, _output: &Self::Output) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Audience this worker's own push endpoint expects on inbound
    /// bearer tokens.
    pub push_audience: String,
    /// This service's own externally reachable base URL, used to build
    /// the task-executor dispatch target.
    pub self_base_url: String,
    pub retry: RetryConfig,
}

pub struct StageWorker<S, A, ST, B, Q, V>
where
    S: StageSpec,
    A: ArtifactStore,
    ST: StateStore,
    B: MessageBus,
    Q: TaskQueueClient,
    V: IdentityVerifier,
{
    spec: S,
    artifacts: A,
    state: ST,
    bus: B,
    queue: Q,
    verifier: V,
    config: WorkerConfig,
}

impl<S, A, ST, B, Q, V> StageWorker<S, A, ST, B, Q, V>
where
    S: StageSpec,
    A: ArtifactStore,
    ST: StateStore,
    B: MessageBus,
    Q: TaskQueueClient,
    V: IdentityVerifier,
{
    pub fn new(spec: S, artifacts: A, state: ST, bus: B, queue: Q, verifier: V, config: WorkerConfig) -> Self {
        Self {
            spec,
            artifacts,
            state,
            bus,
            queue,
            verifier,
            config,
        }
    }

    fn task_name(run_id: &RunId) -> String {
        format!("{}-{}", S::STAGE.as_str(), run_id)
    }

    fn task_url(&self) -> String {
        format!("{}/tasks/{}", self.config.self_base_url, S::STAGE.as_str())
    }

    fn artifact_uri(run_id: &RunId) -> String {
        format!("artifacts/{}/{}.json", run_id, S::STAGE.artifact_name())
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<(), IdentityError> {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| IdentityError::Invalid("missing bearer token".to_string()))?;
        self.verifier.verify(token, &self.config.push_audience).await?;
        Ok(())
    }

    /// Publishes `event`, retrying full-jitter exponential (base 200ms,
    /// cap 3s) until it succeeds or the retry budget is exhausted.
    async fn publish_with_retry(&self, event: &EventEnvelope) -> Result<(), MessageBusError> {
        let payload = serde_json::to_vec(event).expect("EventEnvelope always serializes");
        let deadline = Instant::now() + self.config.retry.retry_budget();
        let mut attempt: u32 = 0;

        loop {
            match self.bus.publish(&event.event_type.to_string(), event.ordering_key(), payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= self.config.retry.max_retries || Instant::now() >= deadline => {
                    warn!(error = %e, attempt, "publish retry budget exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let base = self.config.retry.backoff_base_ms;
                    let cap = self.config.retry.backoff_cap_ms;
                    let exp = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
                    let jittered = rand::thread_rng().gen_range(0..=exp.max(1));
                    debug!(error = %e, attempt, wait_ms = jittered, "publish failed, retrying");
                    tokio::time::sleep(Duration::from_millis(jittered)).await;
                    attempt += 1;
                }
            }
        }
    }

    fn completion_envelope(&self, source: &EventEnvelope, output: &S::Output) -> EventEnvelope {
        let mut artifacts = self.spec.completion_summary(output);
        artifacts.insert("cache_key".to_string(), serde_json::Value::String(source.run_id.to_string()));
        artifacts.insert(
            format!("{}_uri", S::STAGE.as_str()),
            serde_json::Value::String(Self::artifact_uri(&source.run_id)),
        );

        EventEnvelope {
            version: source.version,
            event_type: EventType::completed(S::STAGE),
            run_id: source.run_id.clone(),
            step: S::STAGE,
            input: source.input.clone(),
            artifacts: Some(serde_json::Value::Object(artifacts)),
            correlation_id: source.correlation_id.clone(),
            ts: Utc::now(),
            idempotency_key: source.idempotency_key.clone(),
        }
    }

    fn failed_envelope(&self, source: &EventEnvelope, message: &str) -> EventEnvelope {
        let mut artifacts = serde_json::Map::new();
        artifacts.insert("error".to_string(), serde_json::Value::String(message.to_string()));

        EventEnvelope {
            version: source.version,
            event_type: EventType::failed(S::STAGE),
            run_id: source.run_id.clone(),
            step: S::STAGE,
            input: source.input.clone(),
            artifacts: Some(serde_json::Value::Object(artifacts)),
            correlation_id: source.correlation_id.clone(),
            ts: Utc::now(),
            idempotency_key: source.idempotency_key.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WorkerError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] IdentityError),
    #[error("malformed push envelope: {0}")]
    BadEnvelope(String),
    #[error("enqueue failed: {0}")]
    Enqueue(#[from] TaskQueueError),
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let status = match self {
            WorkerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            WorkerError::BadEnvelope(_) => StatusCode::BAD_REQUEST,
            WorkerError::Enqueue(ref e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            WorkerError::Enqueue(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

/// `POST /events/pubsub`: verify auth, decode the envelope, enqueue the
/// deterministic task, ack fast. Unrecognized event types and already-
/// queued duplicates both ack 2xx.
#[instrument(skip_all)]
pub async fn push_receiver<S, A, ST, B, Q, V>(
    State(worker): State<Arc<StageWorker<S, A, ST, B, Q, V>>>,
    headers: HeaderMap,
    Json(push): Json<PushEnvelope>,
) -> Result<StatusCode, WorkerError>
where
    S: StageSpec,
    A: ArtifactStore,
    ST: StateStore,
    B: MessageBus,
    Q: TaskQueueClient,
    V: IdentityVerifier,
{
    worker.authenticate(&headers).await?;

    let event = push
        .decode_event()
        .map_err(|e| WorkerError::BadEnvelope(e.to_string()))?;

    if event.event_type != EventType::requested(S::STAGE) {
        debug!(event_type = %event.event_type, "ignoring event not meant for this stage");
        return Ok(StatusCode::OK);
    }

    let task_name = StageWorker::<S, A, ST, B, Q, V>::task_name(&event.run_id);
    let task_url = worker.task_url();
    let body = serde_json::to_vec(&event).expect("EventEnvelope always serializes");

    match worker.queue.enqueue(&task_name, &task_url, body).await? {
        TaskEnqueueOutcome::Enqueued => info!(task_name, "enqueued stage task"),
        TaskEnqueueOutcome::AlreadyQueued => debug!(task_name, "task already queued, swallowing duplicate"),
    }

    Ok(StatusCode::OK)
}

/// `POST /tasks/<stage>`: the task-executor algorithm shared by every
/// stage worker.
#[instrument(skip_all, fields(run_id = %event.run_id))]
pub async fn task_executor<S, A, ST, B, Q, V>(
    State(worker): State<Arc<StageWorker<S, A, ST, B, Q, V>>>,
    Json(event): Json<EventEnvelope>,
) -> StatusCode
where
    S: StageSpec,
    A: ArtifactStore,
    ST: StateStore,
    B: MessageBus,
    Q: TaskQueueClient,
    V: IdentityVerifier,
{
    match run_task(&worker, &event).await {
        Ok(()) => StatusCode::OK,
        Err(StageError::Retryable(msg)) => {
            warn!(error_preview = %ContentPreview::of(&msg), "stage task failed, retryable");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(StageError::Permanent(msg)) => {
            warn!(error_preview = %ContentPreview::of(&msg), "stage task failed, permanent");
            let failed = worker.failed_envelope(&event, &msg);
            if let Err(e) = worker.publish_with_retry(&failed).await {
                warn!(error = %e, "failed to publish stage-failed event");
            }
            StatusCode::UNPROCESSABLE_ENTITY
        }
    }
}

async fn run_task<S, A, ST, B, Q, V>(
    worker: &StageWorker<S, A, ST, B, Q, V>,
    event: &EventEnvelope,
) -> Result<(), StageError>
where
    S: StageSpec,
    A: ArtifactStore,
    ST: StateStore,
    B: MessageBus,
    Q: TaskQueueClient,
    V: IdentityVerifier,
{
    if let Some(run) = worker
        .state
        .get_run(&event.run_id)
        .await
        .map_err(|e| StageError::retryable(e))?
    {
        if run.is_terminal() {
            info!("run already terminal, skipping stale task");
            return Ok(());
        }
    }

    let output: S::Output = if worker
        .artifacts
        .exists(&event.run_id, S::STAGE)
        .await
        .map_err(|e| classify_artifact_error(e))?
    {
        let bytes = worker
            .artifacts
            .get(&event.run_id, S::STAGE)
            .await
            .map_err(|e| classify_artifact_error(e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StageError::permanent(format!("stored artifact unreadable: {e}")))?
    } else {
        let predecessor = match S::predecessor() {
            Some(stage) => Some(
                worker
                    .artifacts
                    .get(&event.run_id, stage)
                    .await
                    .map_err(|e| classify_artifact_error(e))?,
            ),
            None => None,
        };

        let output = worker
            .spec
            .execute(&event.run_id, &event.input, predecessor.as_deref())
            .await?;
        worker.spec.validate(&output)?;

        let bytes = serde_json::to_vec(&output)
            .map_err(|e| StageError::permanent(format!("output serialization failed: {e}")))?;
        worker
            .artifacts
            .put(&event.run_id, S::STAGE, bytes)
            .await
            .map_err(|e| StageError::retryable(e))?;

        output
    };

    let completed = worker.completion_envelope(event, &output);
    worker
        .publish_with_retry(&completed)
        .await
        .map_err(|e| StageError::retryable(e))?;

    Ok(())
}

fn classify_artifact_error(e: ArtifactStoreError) -> StageError {
    match e {
        ArtifactStoreError::NotFound { .. } => StageError::permanent(e),
        other => StageError::retryable(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_domain::{EnvelopeInput, Stage};

    struct EchoSpec;

    impl StageSpec for EchoSpec {
        const STAGE: Stage = Stage::Redact;
        type Output = serde_json::Value;

        async fn execute(
            &self,
            _run_id: &RunId,
            _input: &EnvelopeInput,
            predecessor: Option<&[u8]>,
        ) -> Result<Self::Output, StageError> {
            let bytes = predecessor.ok_or_else(|| StageError::permanent("missing predecessor"))?;
            serde_json::from_slice(bytes).map_err(|e| StageError::permanent(e.to_string()))
        }
    }

    #[test]
    fn redact_predecessor_is_transcribe() {
        assert_eq!(EchoSpec::predecessor(), Some(Stage::Transcribe));
    }

    #[test]
    fn soap_predecessor_is_redact_not_audit() {
        struct SoapSpec;
        impl StageSpec for SoapSpec {
            const STAGE: Stage = Stage::Soap;
            type Output = serde_json::Value;
            async fn execute(
                &self,
                _run_id: &RunId,
                _input: &EnvelopeInput,
                _predecessor: Option<&[u8]>,
            ) -> Result<Self::Output, StageError> {
                unreachable!()
            }
        }
        assert_eq!(SoapSpec::predecessor(), Some(Stage::Redact));
    }

    #[test]
    fn task_name_is_deterministic_per_stage_and_run() {
        let run_id = RunId::from_hex("abc123");
        assert_eq!(
            format!("{}-{}", Stage::Redact.as_str(), run_id),
            "redact-abc123"
        );
    }
}
