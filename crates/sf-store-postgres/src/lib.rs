//! Postgres-backed `StateStore`: transactional create/read/update of
//! run, stage and ingestion records.
//!
//! Every multi-field mutation goes through a single transaction that
//! locks the affected row(s) with `SELECT ... FOR UPDATE`, decides the
//! next action from the observed state, and commits — the same
//! ensure-then-compare discipline the event store uses for stream
//! versions, generalized here from "stream version" to "run/stage
//! status". Publishing always happens after commit, in the caller.

use chrono::{DateTime, Utc};
use sf_domain::{
    IdempotencyKey, IngestionRecord, IngestionStatus, InputRef, Run, RunId, RunOutcome,
    RunStatus, Stage, StageRecord, StageStatus,
};
use sf_ports::{
    IngestionUpsertOutcome, RunCreationOutcome, StageTransitionOutcome, StateStore,
    StateStoreError,
};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StateStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StateStoreError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Runs the crate's embedded migrations. Call once at service
    /// startup before accepting traffic.
    pub async fn migrate(&self) -> Result<(), StateStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StateStoreError::Connection(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn conn_err(e: sqlx::Error) -> StateStoreError {
    StateStoreError::Connection(e.to_string())
}

fn ingestion_status_str(status: IngestionStatus) -> &'static str {
    match status {
        IngestionStatus::Processing => "PROCESSING",
        IngestionStatus::Done => "DONE",
        IngestionStatus::FailedTransient => "FAILED_TRANSIENT",
        IngestionStatus::FailedPermanent => "FAILED_PERMANENT",
    }
}

fn parse_ingestion_status(s: &str) -> IngestionStatus {
    match s {
        "DONE" => IngestionStatus::Done,
        "FAILED_TRANSIENT" => IngestionStatus::FailedTransient,
        "FAILED_PERMANENT" => IngestionStatus::FailedPermanent,
        _ => IngestionStatus::Processing,
    }
}

fn run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
    }
}

fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "COMPLETED" => RunStatus::Completed,
        "FAILED" => RunStatus::Failed,
        _ => RunStatus::Running,
    }
}

fn outcome_str(outcome: RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Pass => "PASS",
        RunOutcome::Fail => "FAIL",
    }
}

fn parse_outcome(s: &str) -> Option<RunOutcome> {
    match s {
        "PASS" => Some(RunOutcome::Pass),
        "FAIL" => Some(RunOutcome::Fail),
        _ => None,
    }
}

fn stage_status_str(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => "PENDING",
        StageStatus::Completed => "COMPLETED",
        StageStatus::Failed => "FAILED",
    }
}

fn parse_stage_status(s: &str) -> StageStatus {
    match s {
        "COMPLETED" => StageStatus::Completed,
        "FAILED" => StageStatus::Failed,
        _ => StageStatus::Pending,
    }
}

fn row_to_ingestion(row: &PgRow) -> IngestionRecord {
    IngestionRecord {
        idempotency_key: IdempotencyKey::from_raw(row.get::<String, _>("idempotency_key")),
        status: parse_ingestion_status(row.get("status")),
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        first_seen_at: row.get("first_seen_at"),
        updated_at: row.get("updated_at"),
        ttl_at: row.get("ttl_at"),
        error: row.get("error"),
    }
}

fn row_to_run(row: &PgRow) -> Run {
    Run {
        run_id: RunId::from_hex(row.get::<String, _>("run_id")),
        input: InputRef {
            bucket: row.get("input_bucket"),
            name: row.get("input_name"),
            generation: row.get("input_generation"),
            session_id: row.get("input_session"),
        },
        status: parse_run_status(row.get("status")),
        outcome: row
            .get::<Option<String>, _>("outcome")
            .and_then(|s| parse_outcome(&s)),
        correlation_id: row.get("correlation_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        ttl_at: row.get("ttl_at"),
    }
}

fn row_to_stage(row: &PgRow) -> StageRecord {
    StageRecord {
        stage: Stage::from_str_opt(row.get("stage")).expect("stage column always one of ours"),
        status: parse_stage_status(row.get("status")),
        artifacts: row.get("artifacts"),
        updated_at: row.get("updated_at"),
        error: row.get("error"),
    }
}

impl StateStore for PostgresStateStore {
    #[instrument(skip(self))]
    async fn upsert_ingestion(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        ttl_days: i64,
    ) -> Result<IngestionUpsertOutcome, StateStoreError> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await.map_err(conn_err)?;

        let existing = sqlx::query(
            "SELECT status, attempt_count FROM ingestion_records WHERE idempotency_key = $1 FOR UPDATE",
        )
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(conn_err)?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO ingestion_records
                        (idempotency_key, status, attempt_count, first_seen_at, updated_at, ttl_at)
                     VALUES ($1, 'PROCESSING', 1, $2, $2, $3)",
                )
                .bind(key.as_str())
                .bind(now)
                .bind(now + chrono::Duration::days(ttl_days))
                .execute(&mut *tx)
                .await
                .map_err(conn_err)?;
                IngestionUpsertOutcome::Created
            }
            Some(row) => {
                let status = parse_ingestion_status(row.get("status"));
                if status == IngestionStatus::FailedTransient {
                    let attempt: i32 = row.get("attempt_count");
                    sqlx::query(
                        "UPDATE ingestion_records
                            SET status = 'PROCESSING', attempt_count = $2, updated_at = $3
                          WHERE idempotency_key = $1",
                    )
                    .bind(key.as_str())
                    .bind(attempt + 1)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(conn_err)?;
                    IngestionUpsertOutcome::Retrying
                } else {
                    IngestionUpsertOutcome::Duplicate
                }
            }
        };

        tx.commit().await.map_err(conn_err)?;
        debug!(key = %key, ?outcome, "ingestion upsert");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn mark_ingestion_done(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<(), StateStoreError> {
        sqlx::query("UPDATE ingestion_records SET status = 'DONE', updated_at = $2 WHERE idempotency_key = $1")
            .bind(key.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(conn_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_ingestion_failed(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        permanent: bool,
        error: &str,
    ) -> Result<(), StateStoreError> {
        let status = if permanent { "FAILED_PERMANENT" } else { "FAILED_TRANSIENT" };
        sqlx::query(
            "UPDATE ingestion_records SET status = $2, updated_at = $3, error = $4 WHERE idempotency_key = $1",
        )
        .bind(key.as_str())
        .bind(status)
        .bind(now)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(conn_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_ingestion(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IngestionRecord>, StateStoreError> {
        let row = sqlx::query("SELECT * FROM ingestion_records WHERE idempotency_key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn_err)?;
        Ok(row.as_ref().map(row_to_ingestion))
    }

    #[instrument(skip(self, run))]
    async fn create_run(&self, run: Run) -> Result<RunCreationOutcome, StateStoreError> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await.map_err(conn_err)?;

        let existing = sqlx::query("SELECT * FROM runs WHERE run_id = $1 FOR UPDATE")
            .bind(run.run_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(conn_err)?;

        if let Some(row) = existing {
            tx.commit().await.map_err(conn_err)?;
            return Ok(RunCreationOutcome::AlreadyExists(row_to_run(&row)));
        }

        sqlx::query(
            "INSERT INTO runs
                (run_id, input_bucket, input_name, input_generation, input_session,
                 status, outcome, correlation_id, created_at, updated_at, ttl_at)
             VALUES ($1,$2,$3,$4,$5,$6,NULL,$7,$8,$9,$10)",
        )
        .bind(run.run_id.as_str())
        .bind(&run.input.bucket)
        .bind(&run.input.name)
        .bind(&run.input.generation)
        .bind(&run.input.session_id)
        .bind(run_status_str(run.status))
        .bind(&run.correlation_id)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.ttl_at)
        .execute(&mut *tx)
        .await
        .map_err(conn_err)?;

        sqlx::query(
            "INSERT INTO stage_records (run_id, stage, status, artifacts, updated_at)
             VALUES ($1, 'transcribe', 'PENDING', 'null', $2)",
        )
        .bind(run.run_id.as_str())
        .bind(run.created_at)
        .execute(&mut *tx)
        .await
        .map_err(conn_err)?;

        tx.commit().await.map_err(conn_err)?;
        debug!(run_id = %run.run_id, "run created");
        Ok(RunCreationOutcome::Created(run))
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StateStoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = $1")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn_err)?;
        Ok(row.as_ref().map(row_to_run))
    }

    #[instrument(skip(self))]
    async fn get_stage(
        &self,
        run_id: &RunId,
        stage: Stage,
    ) -> Result<Option<StageRecord>, StateStoreError> {
        let row = sqlx::query("SELECT * FROM stage_records WHERE run_id = $1 AND stage = $2")
            .bind(run_id.as_str())
            .bind(stage.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn_err)?;
        Ok(row.as_ref().map(row_to_stage))
    }

    /// Locks the run row, then the stage row; if the stage is already
    /// terminal (`Completed` or `Failed`) the transition is a no-op —
    /// this is what makes replayed `*.completed`/`*.failed` events safe.
    #[instrument(skip(self, record))]
    async fn apply_stage_transition(
        &self,
        run_id: &RunId,
        stage: Stage,
        record: StageRecord,
    ) -> Result<StageTransitionOutcome, StateStoreError> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await.map_err(conn_err)?;

        let run_row = sqlx::query("SELECT status FROM runs WHERE run_id = $1 FOR UPDATE")
            .bind(run_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(conn_err)?;
        if run_row.is_none() {
            return Err(StateStoreError::RunNotFound(run_id.to_string()));
        }

        let stage_row = sqlx::query(
            "SELECT status FROM stage_records WHERE run_id = $1 AND stage = $2 FOR UPDATE",
        )
        .bind(run_id.as_str())
        .bind(stage.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(conn_err)?;

        let already_terminal = stage_row
            .map(|r| {
                let s = parse_stage_status(r.get("status"));
                matches!(s, StageStatus::Completed | StageStatus::Failed)
            })
            .unwrap_or(false);

        if already_terminal {
            tx.commit().await.map_err(conn_err)?;
            debug!(run_id = %run_id, %stage, "stage transition no-op, already terminal");
            return Ok(StageTransitionOutcome::NoOp);
        }

        sqlx::query(
            "INSERT INTO stage_records (run_id, stage, status, artifacts, updated_at, error)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (run_id, stage) DO UPDATE
                SET status = EXCLUDED.status,
                    artifacts = EXCLUDED.artifacts,
                    updated_at = EXCLUDED.updated_at,
                    error = EXCLUDED.error",
        )
        .bind(run_id.as_str())
        .bind(stage.as_str())
        .bind(stage_status_str(record.status))
        .bind(&record.artifacts)
        .bind(record.updated_at)
        .bind(&record.error)
        .execute(&mut *tx)
        .await
        .map_err(conn_err)?;

        // Advancing to the next stage materializes its PENDING record so
        // the orchestrator's next `*.requested` publish has somewhere to
        // land its eventual completion.
        if record.status == StageStatus::Completed {
            if let Some(next) = stage.next() {
                sqlx::query(
                    "INSERT INTO stage_records (run_id, stage, status, artifacts, updated_at)
                     VALUES ($1, $2, 'PENDING', 'null', $3)
                     ON CONFLICT (run_id, stage) DO NOTHING",
                )
                .bind(run_id.as_str())
                .bind(next.as_str())
                .bind(record.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(conn_err)?;
            }
        }

        tx.commit().await.map_err(conn_err)?;
        debug!(run_id = %run_id, %stage, "stage transition applied");
        Ok(StageTransitionOutcome::Applied)
    }

    #[instrument(skip(self))]
    async fn complete_run(
        &self,
        run_id: &RunId,
        outcome: RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StateStoreError> {
        sqlx::query(
            "UPDATE runs SET status = 'COMPLETED', outcome = $2, updated_at = $3 WHERE run_id = $1",
        )
        .bind(run_id.as_str())
        .bind(outcome_str(outcome))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(conn_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_run(&self, run_id: &RunId, now: DateTime<Utc>) -> Result<(), StateStoreError> {
        sqlx::query("UPDATE runs SET status = 'FAILED', updated_at = $2 WHERE run_id = $1")
            .bind(run_id.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(conn_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingestion_status_round_trips_through_db_strings() {
        for status in [
            IngestionStatus::Processing,
            IngestionStatus::Done,
            IngestionStatus::FailedTransient,
            IngestionStatus::FailedPermanent,
        ] {
            assert_eq!(parse_ingestion_status(ingestion_status_str(status)), status);
        }
    }

    #[test]
    fn stage_status_round_trips_through_db_strings() {
        for status in [StageStatus::Pending, StageStatus::Completed, StageStatus::Failed] {
            assert_eq!(parse_stage_status(stage_status_str(status)), status);
        }
    }

    #[test]
    fn outcome_round_trips_through_db_strings() {
        assert_eq!(parse_outcome(outcome_str(RunOutcome::Pass)), Some(RunOutcome::Pass));
        assert_eq!(parse_outcome(outcome_str(RunOutcome::Fail)), Some(RunOutcome::Fail));
    }

    #[test]
    fn unknown_run_status_defaults_to_running() {
        assert_eq!(parse_run_status("bogus"), RunStatus::Running);
    }
}
