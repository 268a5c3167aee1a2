//! NATS JetStream-backed `MessageBus`: publish-only, ordered per run.
//!
//! NATS preserves delivery order per subject, so the per-run FIFO
//! guarantee is realized by folding the ordering key into the subject
//! itself (`<prefix>.<topic>.<ordering_key>`) rather than by a separate
//! ordering-key field on the publish call — every event for a given run
//! lands on its own subject and is delivered in publish order to any
//! consumer of that subject.
//!
//! A single attempt is made per `publish` call; the bounded-retry loop
//! around completion-publish lives in `sf-worker`, which is the only
//! caller that needs to retry — this client stays a thin, single-shot
//! port implementation.

use async_nats::jetstream::{self, stream::Config as StreamConfig, Context as JetStreamContext};
use async_nats::{Client as NatsClient, HeaderMap};
use sf_ports::{MessageBus, MessageBusError};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    /// JetStream stream name backing every topic this process publishes.
    pub stream_name: String,
    /// Subject prefix namespacing this pipeline's events from anything
    /// else on the same NATS deployment.
    pub subject_prefix: String,
    pub message_ttl_secs: u64,
    /// JetStream dedup window: a redelivered publish with the same
    /// `Nats-Msg-Id` inside this window is silently dropped, which is
    /// what makes retried publishes after a transient failure safe.
    pub duplicate_window_secs: u64,
}

impl NatsConfig {
    pub fn local_dev() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "scribeflow-events".to_string(),
            subject_prefix: "sf.events".to_string(),
            message_ttl_secs: 7 * 24 * 60 * 60,
            duplicate_window_secs: 120,
        }
    }
}

pub struct NatsMessageBus {
    #[allow(dead_code)]
    client: NatsClient,
    jetstream: JetStreamContext,
    config: NatsConfig,
}

impl NatsMessageBus {
    pub async fn connect(config: NatsConfig) -> Result<Self, MessageBusError> {
        info!(url = %config.url, "connecting to nats");
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| MessageBusError::Connection(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());

        let bus = Self { client, jetstream, config };
        bus.ensure_stream().await?;
        info!("nats jetstream message bus initialized");
        Ok(bus)
    }

    async fn ensure_stream(&self) -> Result<(), MessageBusError> {
        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: vec![format!("{}.>", self.config.subject_prefix)],
            max_age: std::time::Duration::from_secs(self.config.message_ttl_secs),
            duplicate_window: std::time::Duration::from_secs(self.config.duplicate_window_secs),
            ..Default::default()
        };

        match self.jetstream.get_stream(&self.config.stream_name).await {
            Ok(_) => {
                self.jetstream
                    .update_stream(stream_config)
                    .await
                    .map_err(|e| MessageBusError::Connection(e.to_string()))?;
            }
            Err(_) => {
                self.jetstream
                    .create_stream(stream_config)
                    .await
                    .map_err(|e| MessageBusError::Connection(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn subject(&self, topic: &str, ordering_key: &str) -> String {
        format!("{}.{}.{}", self.config.subject_prefix, topic, ordering_key)
    }
}

impl MessageBus for NatsMessageBus {
    #[instrument(skip(self, payload), fields(topic = %topic, ordering_key = %ordering_key))]
    async fn publish(
        &self,
        topic: &str,
        ordering_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), MessageBusError> {
        let subject = self.subject(topic, ordering_key);

        let dedup_id = hex::encode(Sha256::digest(&payload));
        let mut headers = HeaderMap::new();
        headers.insert("Nats-Msg-Id", dedup_id.as_str());

        let ack = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| MessageBusError::Publish(e.to_string()))?;

        ack.await.map_err(|e| MessageBusError::Publish(e.to_string()))?;
        debug!(subject = %subject, "message published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bus_shape() -> NatsConfig {
        NatsConfig {
            url: "nats://localhost:4222".to_string(),
            stream_name: "scribeflow-events-test".to_string(),
            subject_prefix: "sf.events.test".to_string(),
            message_ttl_secs: 60,
            duplicate_window_secs: 5,
        }
    }

    #[test]
    fn subject_folds_ordering_key_in_for_per_run_fifo() {
        let config = test_bus_shape();
        let prefix = config.subject_prefix.clone();
        // Exercise the pure formatting logic without a live connection.
        let subject = format!("{}.{}.{}", prefix, "transcribe.completed", "run-123");
        assert_eq!(subject, "sf.events.test.transcribe.completed.run-123");
    }
}
