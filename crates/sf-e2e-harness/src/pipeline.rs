//! Wires the four harness-local `StageWorker`s, the orchestrator/
//! ingestion simulators and the in-memory fakes into one drivable
//! pipeline, via an in-process drive loop: deliver bus messages to the
//! right collaborator, drain dispatched tasks, repeat until nothing
//! moved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use sf_domain::{EventEnvelope, EventType, InputRef, PushEnvelope, Run};
use sf_worker::{push_receiver, task_executor, StageWorker, WorkerConfig};

use crate::fakes::{AllowAllVerifier, InMemoryArtifactStore, InMemoryMessageBus, InMemoryStateStore, InMemoryTaskQueue};
use crate::orchestrator_sim::{self, SimError};
use crate::stubs::{AuditSpec, RedactSpec, SoapSpec, StubComplianceJudge, StubNoteGenerator, StubPhiDetector, StubSpeechToText, TranscribeSpec};

type TranscribeWorker = StageWorker<TranscribeSpec<StubSpeechToText>, InMemoryArtifactStore, InMemoryStateStore, InMemoryMessageBus, InMemoryTaskQueue, AllowAllVerifier>;
type RedactWorker = StageWorker<RedactSpec<StubPhiDetector>, InMemoryArtifactStore, InMemoryStateStore, InMemoryMessageBus, InMemoryTaskQueue, AllowAllVerifier>;
type AuditWorker = StageWorker<AuditSpec<StubComplianceJudge>, InMemoryArtifactStore, InMemoryStateStore, InMemoryMessageBus, InMemoryTaskQueue, AllowAllVerifier>;
type SoapWorker = StageWorker<SoapSpec<StubNoteGenerator>, InMemoryArtifactStore, InMemoryStateStore, InMemoryMessageBus, InMemoryTaskQueue, AllowAllVerifier>;

fn worker_config(stage: &str) -> WorkerConfig {
    WorkerConfig {
        push_audience: "harness-audience".to_string(),
        self_base_url: format!("https://{stage}.harness.local"),
        retry: sf_config::RetryConfig::default(),
    }
}

fn auth_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::AUTHORIZATION, "Bearer harness-token".parse().unwrap());
    headers
}

pub struct Pipeline {
    pub state: InMemoryStateStore,
    pub artifacts: InMemoryArtifactStore,
    pub bus: InMemoryMessageBus,
    pub ttl_days: i64,
    transcribe: Arc<TranscribeWorker>,
    redact: Arc<RedactWorker>,
    audit: Arc<AuditWorker>,
    soap: Arc<SoapWorker>,
    transcribe_queue: InMemoryTaskQueue,
    redact_queue: InMemoryTaskQueue,
    audit_queue: InMemoryTaskQueue,
    soap_queue: InMemoryTaskQueue,
    message_ids: AtomicU64,
}

/// Deterministic model-port scripts a scenario primes before driving
/// the pipeline. Empty vectors fall back to each stub's default
/// well-formed response.
#[derive(Default)]
pub struct PipelineScript {
    pub transcript_text: Option<String>,
    pub transcribe_script: Vec<Result<sf_domain::TranscriptionResult, sf_domain::ModelCallError>>,
    pub audit_script: Vec<Result<sf_domain::AuditArtifact, sf_domain::ModelCallError>>,
    pub soap_script: Vec<Result<String, sf_domain::ModelCallError>>,
    pub redaction_salt: String,
}

impl Pipeline {
    pub fn new(script: PipelineScript) -> Self {
        let state = InMemoryStateStore::default();
        let artifacts = InMemoryArtifactStore::default();
        let bus = InMemoryMessageBus::default();

        let transcribe_queue = InMemoryTaskQueue::default();
        let redact_queue = InMemoryTaskQueue::default();
        let audit_queue = InMemoryTaskQueue::default();
        let soap_queue = InMemoryTaskQueue::default();

        let stt = StubSpeechToText::new(script.transcript_text.unwrap_or_else(|| "patient reports mild headache".to_string()))
            .with_script(script.transcribe_script);
        let transcribe = Arc::new(StageWorker::new(
            TranscribeSpec { stt },
            artifacts.clone(),
            state.clone(),
            bus.clone(),
            transcribe_queue.clone(),
            AllowAllVerifier,
            worker_config("transcribe"),
        ));
        let redact = Arc::new(StageWorker::new(
            RedactSpec { detector: StubPhiDetector, salt: script.redaction_salt.clone() },
            artifacts.clone(),
            state.clone(),
            bus.clone(),
            redact_queue.clone(),
            AllowAllVerifier,
            worker_config("redact"),
        ));
        let audit = Arc::new(StageWorker::new(
            AuditSpec { judge: StubComplianceJudge::new(script.audit_script) },
            artifacts.clone(),
            state.clone(),
            bus.clone(),
            audit_queue.clone(),
            AllowAllVerifier,
            worker_config("audit"),
        ));
        let soap = Arc::new(StageWorker::new(
            SoapSpec { generator: StubNoteGenerator::new(script.soap_script) },
            artifacts.clone(),
            state.clone(),
            bus.clone(),
            soap_queue.clone(),
            AllowAllVerifier,
            worker_config("soap"),
        ));

        Self {
            state,
            artifacts,
            bus,
            ttl_days: 14,
            transcribe,
            redact,
            audit,
            soap,
            transcribe_queue,
            redact_queue,
            audit_queue,
            soap_queue,
            message_ids: AtomicU64::new(0),
        }
    }

    fn next_message_id(&self) -> String {
        format!("harness-msg-{}", self.message_ids.fetch_add(1, Ordering::Relaxed))
    }

    /// Equivalent of a notification landing on the ingestion gateway's
    /// `/events/pubsub`: runs the dedup check, creates (or skips) the
    /// run, and publishes `transcribe.requested` on first sight.
    pub async fn submit_notification(&self, bucket: &str, name: &str, generation: &str, correlation_id: &str) -> Result<(crate::ingestion_sim::PushOutcome, Option<Run>), SimError> {
        let input = InputRef::new(bucket, name, generation, None);
        crate::ingestion_sim::pubsub_push(&self.state, &self.bus, input, correlation_id.to_string(), self.ttl_days).await
    }

    /// Drains the bus and every stage's dispatched-task queue until a
    /// full pass produces no further work, mirroring the
    /// publish-then-react cadence of the live push-based topology.
    pub async fn drive(&self) {
        loop {
            let mut progressed = false;

            for msg in self.bus.drain() {
                progressed = true;
                self.route_bus_message(&msg.payload).await;
            }

            for (_, body) in self.transcribe_queue.take_dispatched() {
                progressed = true;
                self.run_task(&self.transcribe, &body).await;
            }
            for (_, body) in self.redact_queue.take_dispatched() {
                progressed = true;
                self.run_task(&self.redact, &body).await;
            }
            for (_, body) in self.audit_queue.take_dispatched() {
                progressed = true;
                self.run_task(&self.audit, &body).await;
            }
            for (_, body) in self.soap_queue.take_dispatched() {
                progressed = true;
                self.run_task(&self.soap, &body).await;
            }

            if !progressed {
                break;
            }
        }
    }

    async fn route_bus_message(&self, payload: &[u8]) {
        let event: EventEnvelope = match serde_json::from_slice(payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable message on the harness bus");
                return;
            }
        };

        match event.event_type {
            EventType::TranscribeRequested => self.deliver_push(&self.transcribe, &event).await,
            EventType::RedactRequested => self.deliver_push(&self.redact, &event).await,
            EventType::AuditRequested => self.deliver_push(&self.audit, &event).await,
            EventType::SoapRequested => self.deliver_push(&self.soap, &event).await,
            _ => {
                if let Err(e) = orchestrator_sim::handle_event(&self.state, &self.bus, &event).await {
                    tracing::warn!(error = %e, "orchestrator simulation rejected an event");
                }
            }
        }
    }

    async fn deliver_push<S, A, ST, B, Q, V>(&self, worker: &Arc<StageWorker<S, A, ST, B, Q, V>>, event: &EventEnvelope)
    where
        S: sf_worker::StageSpec,
        A: sf_ports::ArtifactStore,
        ST: sf_ports::StateStore,
        B: sf_ports::MessageBus,
        Q: sf_ports::TaskQueueClient,
        V: sf_ports::IdentityVerifier,
    {
        let push = PushEnvelope::encode(event, self.next_message_id(), chrono::Utc::now());
        let response = push_receiver(State(worker.clone()), auth_headers(), Json(push)).await.into_response();
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "push_receiver rejected delivery");
        }
    }

    async fn run_task<S, A, ST, B, Q, V>(&self, worker: &Arc<StageWorker<S, A, ST, B, Q, V>>, body: &[u8])
    where
        S: sf_worker::StageSpec,
        A: sf_ports::ArtifactStore,
        ST: sf_ports::StateStore,
        B: sf_ports::MessageBus,
        Q: sf_ports::TaskQueueClient,
        V: sf_ports::IdentityVerifier,
    {
        let event: EventEnvelope = match serde_json::from_slice(body) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable dispatched task body");
                return;
            }
        };
        let status = task_executor(State(worker.clone()), Json(event)).await;
        if !status.is_success() {
            tracing::debug!(%status, "stage task did not complete on first attempt");
        }
    }
}
