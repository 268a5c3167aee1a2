//! Port traits the ingestion gateway, orchestrator, and stage workers
//! code against. Adapters in separate crates provide the concrete
//! Postgres, S3/MinIO, NATS and OIDC implementations.

use std::future::Future;

use chrono::{DateTime, Utc};
use sf_domain::{IdempotencyKey, IngestionRecord, Run, RunId, RunOutcome, Stage, StageRecord};

/// Content-addressed-by-path artifact storage. Each stage worker owns
/// writes to its own `artifacts/<run_id>/<stage>.json` object; nothing
/// else ever writes there.
pub trait ArtifactStore: Send + Sync {
    fn put(
        &self,
        run_id: &RunId,
        stage: Stage,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<(), ArtifactStoreError>> + Send;

    fn get(
        &self,
        run_id: &RunId,
        stage: Stage,
    ) -> impl Future<Output = Result<Vec<u8>, ArtifactStoreError>> + Send;

    /// Object existence at the deterministic path doubles as the
    /// idempotency check ahead of running a stage's business logic.
    fn exists(
        &self,
        run_id: &RunId,
        stage: Stage,
    ) -> impl Future<Output = Result<bool, ArtifactStoreError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactStoreError {
    #[error("artifact not found: run {run_id} stage {stage}")]
    NotFound { run_id: String, stage: String },
    #[error("object store connection error: {0}")]
    Connection(String),
    #[error("object store returned an unexpected error: {0}")]
    Backend(String),
}

impl ArtifactStoreError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ArtifactStoreError::NotFound { .. })
    }
}

/// Outcome of the ingestion gateway's dedup upsert, per the duplicate
/// classification rules the ingestion gateway applies on each notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionUpsertOutcome {
    /// No prior record; caller should proceed to dispatch.
    Created,
    /// Record was PROCESSING or DONE or FAILED_PERMANENT; ack and stop.
    Duplicate,
    /// Record was FAILED_TRANSIENT; reset to PROCESSING, caller retries
    /// the dispatch.
    Retrying,
}

/// Outcome of creating (or finding) a run, for the orchestrator's
/// `create-run` entrypoint.
#[derive(Debug, Clone)]
pub enum RunCreationOutcome {
    Created(Run),
    AlreadyExists(Run),
}

/// Outcome of attempting to advance a stage, used to make every
/// `*.completed`/`*.failed` handler idempotent: replays collapse to
/// `NoOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTransitionOutcome {
    Applied,
    NoOp,
}

/// Transactional state store: Run, StageRecord and IngestionRecord
/// tables behind a single Postgres-style client, with read-decide-
/// commit transactions so publishing never races the database write.
pub trait StateStore: Send + Sync {
    fn upsert_ingestion(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        ttl_days: i64,
    ) -> impl Future<Output = Result<IngestionUpsertOutcome, StateStoreError>> + Send;

    fn mark_ingestion_done(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StateStoreError>> + Send;

    fn mark_ingestion_failed(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        permanent: bool,
        error: &str,
    ) -> impl Future<Output = Result<(), StateStoreError>> + Send;

    fn get_ingestion(
        &self,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<Option<IngestionRecord>, StateStoreError>> + Send;

    fn create_run(
        &self,
        run: Run,
    ) -> impl Future<Output = Result<RunCreationOutcome, StateStoreError>> + Send;

    fn get_run(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = Result<Option<Run>, StateStoreError>> + Send;

    fn get_stage(
        &self,
        run_id: &RunId,
        stage: Stage,
    ) -> impl Future<Output = Result<Option<StageRecord>, StateStoreError>> + Send;

    /// Apply a `*.completed` or `*.failed` observation for `stage`.
    /// Locks the run row, checks the stage is not already terminal,
    /// and applies the transition in one transaction; returns `NoOp`
    /// when the stage was already `Completed` or `Failed`.
    fn apply_stage_transition(
        &self,
        run_id: &RunId,
        stage: Stage,
        record: StageRecord,
    ) -> impl Future<Output = Result<StageTransitionOutcome, StateStoreError>> + Send;

    /// Finalize a run that reached a terminal stage outcome (audit
    /// rejection or soap completion): `status=COMPLETED`, outcome set.
    fn complete_run(
        &self,
        run_id: &RunId,
        outcome: RunOutcome,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StateStoreError>> + Send;

    /// Finalize a run whose current stage raised a `*.failed` event:
    /// `status=FAILED`, outcome left unset. Applies to any stage's
    /// failure transition, not just the one that triggered it.
    fn fail_run(
        &self,
        run_id: &RunId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StateStoreError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("transient contention, retry: {0}")]
    Contention(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
}

impl StateStoreError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StateStoreError::RunNotFound(_))
    }
}

/// Publish-only messaging port. Nothing in this system pulls from a
/// subscription in-process: stage workers and the orchestrator receive
/// events via HTTP push, so the only capability the port needs is
/// ordered publish.
pub trait MessageBus: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        ordering_key: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), MessageBusError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum MessageBusError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("publish rejected: {0}")]
    Publish(String),
}

impl MessageBusError {
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Task enqueue client: deterministic, dedup-by-name enqueue onto the
/// queue fronting a stage worker's `task_executor` endpoint.
pub trait TaskQueueClient: Send + Sync {
    fn enqueue(
        &self,
        task_name: &str,
        target_url: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<TaskEnqueueOutcome, TaskQueueError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEnqueueOutcome {
    Enqueued,
    AlreadyQueued,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("queue rejected the task: {0}")]
    Rejected(String),
}

impl TaskQueueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskQueueError::Connection(_))
    }
}

/// Verifies push-authenticity of inbound HTTP calls: a signed bearer
/// token checked against a configured audience and an accepted issuer
/// set.
pub trait IdentityVerifier: Send + Sync {
    fn verify(
        &self,
        bearer_token: &str,
        expected_audience: &str,
    ) -> impl Future<Output = Result<VerifiedClaims, IdentityError>> + Send;
}

#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    pub issuer: String,
    pub subject: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("token expired")]
    Expired,
    #[error("unrecognized issuer: {0}")]
    UnknownIssuer(String),
    #[error("audience mismatch")]
    AudienceMismatch,
    #[error("malformed or unverifiable token: {0}")]
    Invalid(String),
    #[error("could not reach key discovery endpoint: {0}")]
    KeySourceUnavailable(String),
}

/// Deterministic time source, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
