//! In-memory stand-ins for the five `sf-ports` traits, letting the
//! stage-worker and orchestrator code run in-process against fakes
//! instead of a live Postgres/object-storage/messaging deployment.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sf_domain::{IdempotencyKey, IngestionRecord, IngestionStatus, Run, RunId, RunOutcome, Stage, StageRecord, StageStatus};
use sf_ports::{
    ArtifactStore, ArtifactStoreError, IdentityError, IdentityVerifier, IngestionUpsertOutcome,
    MessageBus, MessageBusError, RunCreationOutcome, StateStore, StateStoreError,
    StageTransitionOutcome, TaskEnqueueOutcome, TaskQueueClient, TaskQueueError, VerifiedClaims,
};

#[derive(Clone, Default)]
pub struct InMemoryArtifactStore {
    inner: Arc<Mutex<HashMap<(RunId, Stage), Vec<u8>>>>,
}

impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, run_id: &RunId, stage: Stage, body: Vec<u8>) -> Result<(), ArtifactStoreError> {
        self.inner.lock().unwrap().insert((run_id.clone(), stage), body);
        Ok(())
    }

    async fn get(&self, run_id: &RunId, stage: Stage) -> Result<Vec<u8>, ArtifactStoreError> {
        self.inner
            .lock()
            .unwrap()
            .get(&(run_id.clone(), stage))
            .cloned()
            .ok_or_else(|| ArtifactStoreError::NotFound {
                run_id: run_id.to_string(),
                stage: stage.to_string(),
            })
    }

    async fn exists(&self, run_id: &RunId, stage: Stage) -> Result<bool, ArtifactStoreError> {
        Ok(self.inner.lock().unwrap().contains_key(&(run_id.clone(), stage)))
    }
}

#[derive(Default)]
struct StateInner {
    ingestion: HashMap<IdempotencyKey, IngestionRecord>,
    runs: HashMap<RunId, Run>,
    stages: HashMap<(RunId, Stage), StageRecord>,
}

/// Mirrors the transaction semantics of `sf-store-postgres`'s adapter:
/// row-locking is unnecessary with a single process-wide mutex, but the
/// read-decide-commit shape (including the "insert the next stage's
/// PENDING placeholder on newly-Completed" behavior) is reproduced
/// exactly so the harness exercises the same state machine.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    inner: Arc<Mutex<StateInner>>,
}

impl StateStore for InMemoryStateStore {
    async fn upsert_ingestion(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        ttl_days: i64,
    ) -> Result<IngestionUpsertOutcome, StateStoreError> {
        let mut guard = self.inner.lock().unwrap();
        match guard.ingestion.get_mut(key) {
            None => {
                guard
                    .ingestion
                    .insert(key.clone(), IngestionRecord::new_processing(key.clone(), now, ttl_days));
                Ok(IngestionUpsertOutcome::Created)
            }
            Some(record) if record.status.is_settled() => Ok(IngestionUpsertOutcome::Duplicate),
            Some(record) if record.status == IngestionStatus::Processing => Ok(IngestionUpsertOutcome::Duplicate),
            Some(record) => {
                record.status = IngestionStatus::Processing;
                record.attempt_count += 1;
                record.updated_at = now;
                record.error = None;
                Ok(IngestionUpsertOutcome::Retrying)
            }
        }
    }

    async fn mark_ingestion_done(&self, key: &IdempotencyKey, now: DateTime<Utc>) -> Result<(), StateStoreError> {
        let mut guard = self.inner.lock().unwrap();
        let record = guard
            .ingestion
            .get_mut(key)
            .ok_or_else(|| StateStoreError::RunNotFound(key.to_string()))?;
        record.status = IngestionStatus::Done;
        record.updated_at = now;
        Ok(())
    }

    async fn mark_ingestion_failed(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        permanent: bool,
        error: &str,
    ) -> Result<(), StateStoreError> {
        let mut guard = self.inner.lock().unwrap();
        let record = guard
            .ingestion
            .get_mut(key)
            .ok_or_else(|| StateStoreError::RunNotFound(key.to_string()))?;
        record.status = if permanent {
            IngestionStatus::FailedPermanent
        } else {
            IngestionStatus::FailedTransient
        };
        record.updated_at = now;
        record.error = Some(error.to_string());
        Ok(())
    }

    async fn get_ingestion(&self, key: &IdempotencyKey) -> Result<Option<IngestionRecord>, StateStoreError> {
        Ok(self.inner.lock().unwrap().ingestion.get(key).cloned())
    }

    async fn create_run(&self, run: Run) -> Result<RunCreationOutcome, StateStoreError> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(existing) = guard.runs.get(&run.run_id) {
            return Ok(RunCreationOutcome::AlreadyExists(existing.clone()));
        }
        guard.runs.insert(run.run_id.clone(), run.clone());
        guard
            .stages
            .insert((run.run_id.clone(), Stage::Transcribe), StageRecord::pending(Stage::Transcribe, run.created_at));
        Ok(RunCreationOutcome::Created(run))
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StateStoreError> {
        Ok(self.inner.lock().unwrap().runs.get(run_id).cloned())
    }

    async fn get_stage(&self, run_id: &RunId, stage: Stage) -> Result<Option<StageRecord>, StateStoreError> {
        Ok(self.inner.lock().unwrap().stages.get(&(run_id.clone(), stage)).cloned())
    }

    async fn apply_stage_transition(
        &self,
        run_id: &RunId,
        stage: Stage,
        record: StageRecord,
    ) -> Result<StageTransitionOutcome, StateStoreError> {
        let mut guard = self.inner.lock().unwrap();
        if !guard.runs.contains_key(run_id) {
            return Err(StateStoreError::RunNotFound(run_id.to_string()));
        }
        if let Some(existing) = guard.stages.get(&(run_id.clone(), stage)) {
            if existing.is_completed() || matches!(existing.status, StageStatus::Failed) {
                return Ok(StageTransitionOutcome::NoOp);
            }
        }
        let newly_completed = record.is_completed();
        guard.stages.insert((run_id.clone(), stage), record.clone());
        if newly_completed {
            if let Some(next) = stage.next() {
                guard
                    .stages
                    .entry((run_id.clone(), next))
                    .or_insert_with(|| StageRecord::pending(next, record.updated_at));
            }
        }
        Ok(StageTransitionOutcome::Applied)
    }

    async fn complete_run(&self, run_id: &RunId, outcome: RunOutcome, now: DateTime<Utc>) -> Result<(), StateStoreError> {
        let mut guard = self.inner.lock().unwrap();
        let run = guard
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StateStoreError::RunNotFound(run_id.to_string()))?;
        run.status = sf_domain::RunStatus::Completed;
        run.outcome = Some(outcome);
        run.updated_at = now;
        Ok(())
    }

    async fn fail_run(&self, run_id: &RunId, now: DateTime<Utc>) -> Result<(), StateStoreError> {
        let mut guard = self.inner.lock().unwrap();
        let run = guard
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StateStoreError::RunNotFound(run_id.to_string()))?;
        run.status = sf_domain::RunStatus::Failed;
        run.updated_at = now;
        Ok(())
    }
}

pub struct PublishedMessage {
    pub topic: String,
    pub ordering_key: String,
    pub payload: Vec<u8>,
}

/// Publish-only fake. `fail_next` lets a scenario inject a handful of
/// transient publish failures to exercise the stage worker's own
/// full-jitter retry loop before the message goes through.
#[derive(Clone, Default)]
pub struct InMemoryMessageBus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Default)]
struct BusInner {
    published: VecDeque<PublishedMessage>,
    fail_next: u32,
}

impl InMemoryMessageBus {
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.lock().unwrap().fail_next = count;
    }

    pub fn drain(&self) -> Vec<PublishedMessage> {
        self.inner.lock().unwrap().published.drain(..).collect()
    }
}

impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, ordering_key: &str, payload: Vec<u8>) -> Result<(), MessageBusError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.fail_next > 0 {
            guard.fail_next -= 1;
            return Err(MessageBusError::Connection("injected failure".to_string()));
        }
        guard.published.push_back(PublishedMessage {
            topic: topic.to_string(),
            ordering_key: ordering_key.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Dedup-by-task-name enqueue. Deliberately holds no reference to the
/// `StageWorker` it will eventually drive: a `TaskQueueClient` fake
/// parameterized with the very `StageWorker<..., Q, ...>` it belongs to
/// would be a self-referential type. Instead the harness's drive loop
/// drains `take_dispatched` and calls `sf_worker::task_executor`
/// directly against the concrete worker it separately owns.
#[derive(Clone, Default)]
pub struct InMemoryTaskQueue {
    inner: Arc<Mutex<QueueInner>>,
}

#[derive(Default)]
struct QueueInner {
    seen: HashSet<String>,
    dispatched: VecDeque<(String, Vec<u8>)>,
}

impl InMemoryTaskQueue {
    pub fn take_dispatched(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().unwrap().dispatched.drain(..).collect()
    }
}

impl TaskQueueClient for InMemoryTaskQueue {
    async fn enqueue(&self, task_name: &str, _target_url: &str, body: Vec<u8>) -> Result<TaskEnqueueOutcome, TaskQueueError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.seen.contains(task_name) {
            return Ok(TaskEnqueueOutcome::AlreadyQueued);
        }
        guard.seen.insert(task_name.to_string());
        guard.dispatched.push_back((task_name.to_string(), body));
        Ok(TaskEnqueueOutcome::Enqueued)
    }
}

/// Accepts any bearer token. Production push-authenticity is
/// `sf-auth`'s OIDC/JWKS verifier; this harness only needs a
/// `StageWorker`-shaped collaborator that always succeeds so scenarios
/// can focus on pipeline semantics rather than re-deriving JWTs.
#[derive(Clone, Default)]
pub struct AllowAllVerifier;

impl IdentityVerifier for AllowAllVerifier {
    async fn verify(&self, bearer_token: &str, _expected_audience: &str) -> Result<VerifiedClaims, IdentityError> {
        if bearer_token.is_empty() {
            return Err(IdentityError::Invalid("empty token".to_string()));
        }
        Ok(VerifiedClaims {
            issuer: "harness".to_string(),
            subject: "harness".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}
