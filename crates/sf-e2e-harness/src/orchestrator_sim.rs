//! Harness-local reimplementation of `sf-orchestrator`'s `create_run`
//! and `handle_event` handlers, minus the axum/auth plumbing. Grounded
//! directly on `sf-orchestrator/src/main.rs`: same state-machine
//! transitions, same `requested_envelope` shape, same audit-branch
//! `hipaa_pass` default-true read. `sf-orchestrator` is a bin-only
//! crate with no lib surface, so this logic can't be imported — only
//! exercised in the same shape.

use chrono::Utc;
use sf_domain::{
    EnvelopeInput, EventEnvelope, EventType, InputRef, Run, RunOutcome, Stage, StageRecord, StageStatus,
};
use sf_ports::{MessageBus, RunCreationOutcome, StateStore, StageTransitionOutcome};

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("state store error: {0}")]
    State(String),
    #[error("message bus error: {0}")]
    Bus(String),
    #[error("{0}")]
    Invariant(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub fn requested_envelope(run: &Run, stage: Stage) -> EventEnvelope {
    EventEnvelope {
        version: 1,
        event_type: EventType::requested(stage),
        run_id: run.run_id.clone(),
        step: stage,
        input: EnvelopeInput {
            bucket: run.input.bucket.clone(),
            name: run.input.name.clone(),
            generation: run.input.generation.clone(),
            session: run.input.session_id.clone(),
        },
        artifacts: None,
        correlation_id: run.correlation_id.clone(),
        ts: Utc::now(),
        idempotency_key: Some(run.run_id.to_string()),
    }
}

async fn publish<B: MessageBus>(bus: &B, event: &EventEnvelope) -> Result<(), SimError> {
    let payload = serde_json::to_vec(event)?;
    bus.publish(&event.event_type.to_string(), event.ordering_key(), payload)
        .await
        .map_err(|e| SimError::Bus(e.to_string()))
}

/// `POST /run` minus the HTTP layer: create-or-return a run, publishing
/// `transcribe.requested` only on the creating call.
pub async fn create_run<ST: StateStore, B: MessageBus>(
    state: &ST,
    bus: &B,
    input: InputRef,
    correlation_id: String,
    ttl_days: i64,
) -> Result<(Run, bool), SimError> {
    let run_id = sf_domain::RunId::from_input(&input);
    let now = Utc::now();
    let run = Run::new_running(run_id, input, correlation_id, now, ttl_days);

    let outcome = state.create_run(run).await.map_err(|e| SimError::State(e.to_string()))?;
    let (run, created) = match outcome {
        RunCreationOutcome::Created(run) => (run, true),
        RunCreationOutcome::AlreadyExists(run) => (run, false),
    };

    if created {
        let event = requested_envelope(&run, Stage::Transcribe);
        publish(bus, &event).await?;
    }

    Ok((run, created))
}

/// `POST /events/pubsub` minus the HTTP layer: applies the transition
/// table from `sf-orchestrator::handle_event` to a decoded
/// `EventEnvelope`, publishing the next `*.requested` event or
/// finalizing the run as appropriate. Returns `Ok(())` for every
/// event this orchestrator acts on or deliberately ignores — matching
/// the production handler's "ignore and 200" behavior for event types
/// it isn't wired to react to.
pub async fn handle_event<ST: StateStore, B: MessageBus>(state: &ST, bus: &B, event: &EventEnvelope) -> Result<(), SimError> {
    let stage = event.event_type.stage();
    let now = Utc::now();

    if matches!(
        event.event_type,
        EventType::TranscribeFailed | EventType::RedactFailed | EventType::AuditFailed | EventType::SoapFailed
    ) {
        let record = StageRecord {
            stage,
            status: StageStatus::Failed,
            artifacts: event.artifacts.clone().unwrap_or(serde_json::Value::Null),
            updated_at: now,
            error: event.artifacts.as_ref().and_then(|v| v.get("error")).and_then(|v| v.as_str()).map(str::to_string),
        };
        if state.apply_stage_transition(&event.run_id, stage, record).await.map_err(|e| SimError::State(e.to_string()))?
            == StageTransitionOutcome::Applied
        {
            state.fail_run(&event.run_id, now).await.map_err(|e| SimError::State(e.to_string()))?;
        }
        return Ok(());
    }

    if event.event_type != EventType::completed(stage) {
        return Ok(());
    }

    let record = StageRecord {
        stage,
        status: StageStatus::Completed,
        artifacts: event.artifacts.clone().unwrap_or(serde_json::Value::Null),
        updated_at: now,
        error: None,
    };

    if state.apply_stage_transition(&event.run_id, stage, record).await.map_err(|e| SimError::State(e.to_string()))?
        == StageTransitionOutcome::NoOp
    {
        return Ok(());
    }

    let run = state
        .get_run(&event.run_id)
        .await
        .map_err(|e| SimError::State(e.to_string()))?
        .ok_or_else(|| SimError::Invariant("run vanished mid-transition".to_string()))?;

    match stage {
        Stage::Transcribe | Stage::Redact => {
            let next = stage.next().expect("transcribe/redact always have a successor");
            let next_event = requested_envelope(&run, next);
            publish(bus, &next_event).await?;
        }
        Stage::Audit => {
            let hipaa_pass = event.artifacts.as_ref().and_then(|v| v.get("hipaa_pass")).and_then(|v| v.as_bool()).unwrap_or(true);
            if hipaa_pass {
                let next_event = requested_envelope(&run, Stage::Soap);
                publish(bus, &next_event).await?;
            } else {
                state.complete_run(&event.run_id, RunOutcome::Fail, now).await.map_err(|e| SimError::State(e.to_string()))?;
            }
        }
        Stage::Soap => {
            state.complete_run(&event.run_id, RunOutcome::Pass, now).await.map_err(|e| SimError::State(e.to_string()))?;
        }
    }

    Ok(())
}
