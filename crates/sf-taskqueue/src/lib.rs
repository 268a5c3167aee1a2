//! HTTP task-queue client: deterministic, dedup-by-name enqueue onto
//! the queue fronting a stage worker's `task_executor` endpoint.
//!
//! Modeled on the Cloud-Tasks-style `CreateTask` contract: the queue's
//! own delivery substrate and retry policy are an external collaborator
//! — this client just builds the request and classifies the queue's
//! response. Per the real Cloud Tasks semantics this mirrors, creating a
//! task whose name already exists returns `ALREADY_EXISTS` (409 here),
//! which is exactly the dedup-by-name behavior the push-receiver relies
//! on.

use base64::{engine::general_purpose::STANDARD, Engine};
use sf_auth::{IdentityTokenCache, TokenMinter};
use sf_ports::{TaskEnqueueOutcome, TaskQueueClient, TaskQueueError};
use serde::Serialize;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Base URL of the queue management API, e.g.
    /// `https://cloudtasks.googleapis.com/v2/projects/p/locations/l/queues/q`.
    pub queue_api_base: String,
    /// Service account identity the dispatched task authenticates as
    /// when the queue calls `target_url` — forwarded as the task's
    /// `oidc_token.service_account_email`.
    pub caller_service_identity: String,
    /// Audience the queue mints the dispatch-time OIDC token for;
    /// typically the stage worker's own base URL.
    pub push_audience: String,
}

#[derive(Serialize)]
struct OidcToken<'a> {
    service_account_email: &'a str,
    audience: &'a str,
}

#[derive(Serialize)]
struct HttpRequest<'a> {
    url: &'a str,
    #[serde(rename = "httpMethod")]
    http_method: &'static str,
    body: String,
    #[serde(rename = "oidcToken")]
    oidc_token: OidcToken<'a>,
}

#[derive(Serialize)]
struct CreateTaskBody<'a> {
    name: &'a str,
    #[serde(rename = "httpRequest")]
    http_request: HttpRequest<'a>,
}

pub struct HttpTaskQueueClient<M: TokenMinter> {
    config: TaskQueueConfig,
    http: reqwest::Client,
    tokens: IdentityTokenCache<M>,
}

impl<M: TokenMinter> HttpTaskQueueClient<M> {
    pub fn new(config: TaskQueueConfig, http: reqwest::Client, minter: M) -> Self {
        Self {
            config,
            http,
            tokens: IdentityTokenCache::new(minter),
        }
    }
}

impl<M: TokenMinter + Send + Sync> TaskQueueClient for HttpTaskQueueClient<M> {
    #[instrument(skip(self, body), fields(task_name = %task_name))]
    async fn enqueue(
        &self,
        task_name: &str,
        target_url: &str,
        body: Vec<u8>,
    ) -> Result<TaskEnqueueOutcome, TaskQueueError> {
        let caller_token = self
            .tokens
            .get(&self.config.queue_api_base)
            .await
            .map_err(|e| TaskQueueError::Connection(e.to_string()))?;

        let request_body = CreateTaskBody {
            name: task_name,
            http_request: HttpRequest {
                url: target_url,
                http_method: "POST",
                body: STANDARD.encode(&body),
                oidc_token: OidcToken {
                    service_account_email: &self.config.caller_service_identity,
                    audience: &self.config.push_audience,
                },
            },
        };

        let response = self
            .http
            .post(format!("{}/tasks", self.config.queue_api_base))
            .bearer_auth(caller_token)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| TaskQueueError::Connection(e.to_string()))?;

        match response.status() {
            s if s.is_success() => {
                debug!(task_name, "task enqueued");
                Ok(TaskEnqueueOutcome::Enqueued)
            }
            reqwest::StatusCode::CONFLICT => {
                debug!(task_name, "task already queued, dedup by name");
                Ok(TaskEnqueueOutcome::AlreadyQueued)
            }
            s if s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                Err(TaskQueueError::Connection(format!("queue returned {s}")))
            }
            s => {
                warn!(task_name, status = %s, "queue rejected task");
                Err(TaskQueueError::Rejected(format!("queue returned {s}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_task_body_serializes_expected_shape() {
        let body = CreateTaskBody {
            name: "transcribe-abc123",
            http_request: HttpRequest {
                url: "https://transcribe.internal/tasks/transcribe",
                http_method: "POST",
                body: STANDARD.encode(b"{}"),
                oidc_token: OidcToken {
                    service_account_email: "svc@project.iam.gserviceaccount.com",
                    audience: "https://transcribe.internal",
                },
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["name"], "transcribe-abc123");
        assert_eq!(json["httpRequest"]["httpMethod"], "POST");
        assert_eq!(
            json["httpRequest"]["oidcToken"]["audience"],
            "https://transcribe.internal"
        );
    }
}
