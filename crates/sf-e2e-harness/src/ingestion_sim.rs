//! Harness-local reimplementation of `sf-ingestion`'s `pubsub_push`
//! handler, minus the axum/auth/HTTP-dispatch plumbing. Grounded on
//! `sf-ingestion/src/main.rs`: same dedup-ledger upsert, same
//! duplicate-acks-without-dispatch short circuit, same
//! done/failed-permanent bookkeeping after the downstream call. The
//! production gateway dispatches to the orchestrator over HTTP; here
//! it calls `orchestrator_sim::create_run` in-process instead, since
//! there is no live orchestrator to reach.

use chrono::Utc;
use sf_domain::{IdempotencyKey, InputRef, Run};
use sf_ports::{IngestionUpsertOutcome, MessageBus, StateStore};

use crate::orchestrator_sim::{self, SimError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// A prior ingestion record already settled (or is in flight); the
    /// notification was acked without creating or re-requesting a run.
    Duplicate,
    /// Dispatched to the orchestrator-equivalent; `created` mirrors
    /// whether a brand new run was inserted.
    Dispatched { created: bool },
}

pub async fn pubsub_push<ST: StateStore, B: MessageBus>(
    state: &ST,
    bus: &B,
    input: InputRef,
    correlation_id: String,
    ttl_days: i64,
) -> Result<(PushOutcome, Option<Run>), SimError> {
    let idem_key = IdempotencyKey::from_input(&input);
    let now = Utc::now();

    let outcome = state
        .upsert_ingestion(&idem_key, now, ttl_days)
        .await
        .map_err(|e| SimError::State(e.to_string()))?;

    if let IngestionUpsertOutcome::Duplicate = outcome {
        return Ok((PushOutcome::Duplicate, None));
    }

    match orchestrator_sim::create_run(state, bus, input, correlation_id, ttl_days).await {
        Ok((run, created)) => {
            state.mark_ingestion_done(&idem_key, Utc::now()).await.map_err(|e| SimError::State(e.to_string()))?;
            Ok((PushOutcome::Dispatched { created }, Some(run)))
        }
        Err(e) => {
            state
                .mark_ingestion_failed(&idem_key, Utc::now(), false, &e.to_string())
                .await
                .map_err(|se| SimError::State(se.to_string()))?;
            Err(e)
        }
    }
}
