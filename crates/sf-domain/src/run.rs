//! The `Run` aggregate: one end-to-end execution of the pipeline.

use crate::ids::{InputRef, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub input: InputRef,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ttl_at: DateTime<Utc>,
}

impl Run {
    pub fn new_running(
        run_id: RunId,
        input: InputRef,
        correlation_id: String,
        now: DateTime<Utc>,
        ttl_days: i64,
    ) -> Self {
        Self {
            run_id,
            input,
            status: RunStatus::Running,
            outcome: None,
            correlation_id,
            created_at: now,
            updated_at: now,
            ttl_at: now + chrono::Duration::days(ttl_days),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, RunStatus::Running)
    }
}
