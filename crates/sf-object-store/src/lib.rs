//! S3/MinIO-compatible artifact store. Each stage worker writes its own
//! artifact at the deterministic path `artifacts/<run_id>/<stage>.json`;
//! existence of that object is the idempotency signal the worker
//! skeleton checks before invoking its business function.

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    operation::{get_object::GetObjectError, head_object::HeadObjectError},
    primitives::ByteStream,
    Client as S3Client,
};
use bytes::Bytes;
use sf_domain::{RunId, Stage};
use sf_ports::{ArtifactStore, ArtifactStoreError};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// Endpoint URL, e.g. `http://localhost:9000` for a local MinIO.
    /// Leave unset (`None`) to use the AWS SDK's default resolver.
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    /// MinIO requires path-style addressing; real S3 does not.
    pub force_path_style: bool,
}

impl ObjectStoreConfig {
    pub fn local_dev() -> Self {
        Self {
            endpoint: Some("http://localhost:9000".to_string()),
            region: "us-east-1".to_string(),
            access_key_id: "minioadmin".to_string(),
            secret_access_key: "minioadmin".to_string(),
            bucket: "scribeflow-artifacts".to_string(),
            force_path_style: true,
        }
    }
}

/// S3/MinIO-backed artifact store. One `S3Client` per process, shared
/// across every stage worker instance via `Arc`.
pub struct S3ArtifactStore {
    client: S3Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub async fn new(config: ObjectStoreConfig) -> Result<Self, ArtifactStoreError> {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "sf-object-store",
        );

        let mut builder = S3ConfigBuilder::new()
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style)
            .behavior_version(BehaviorVersion::latest());

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = S3Client::from_conf(builder.build());
        info!(bucket = %config.bucket, "object store client initialized");

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    /// Deterministic object key: `artifacts/<run_id>/<stage-filename>.json`.
    fn key(run_id: &RunId, stage: Stage) -> String {
        format!("artifacts/{}/{}.json", run_id.as_str(), stage.artifact_name())
    }
}

impl ArtifactStore for S3ArtifactStore {
    #[instrument(skip(self, body), fields(bucket = %self.bucket))]
    async fn put(&self, run_id: &RunId, stage: Stage, body: Vec<u8>) -> Result<(), ArtifactStoreError> {
        let key = Self::key(run_id, stage);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(Bytes::from(body)))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| ArtifactStoreError::Backend(format!("put {key} failed: {e}")))?;
        debug!(key = %key, "artifact written");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, run_id: &RunId, stage: Stage) -> Result<Vec<u8>, ArtifactStoreError> {
        let key = Self::key(run_id, stage);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                match &service_err {
                    GetObjectError::NoSuchKey(_) => ArtifactStoreError::NotFound {
                        run_id: run_id.to_string(),
                        stage: stage.to_string(),
                    },
                    _ => ArtifactStoreError::Backend(format!("get {key} failed: {service_err:?}")),
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| ArtifactStoreError::Connection(e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn exists(&self, run_id: &RunId, stage: Stage) -> Result<bool, ArtifactStoreError> {
        let key = Self::key(run_id, stage);
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if matches!(service_err, HeadObjectError::NotFound(_)) {
                    Ok(false)
                } else {
                    warn!(key = %key, error = ?service_err, "head_object failed");
                    Err(ArtifactStoreError::Backend(format!("{service_err:?}")))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_deterministic_artifact_filename() {
        let run_id = RunId::from_hex("abc123");
        assert_eq!(
            S3ArtifactStore::key(&run_id, Stage::Transcribe),
            "artifacts/abc123/transcript.json"
        );
        assert_eq!(
            S3ArtifactStore::key(&run_id, Stage::Soap),
            "artifacts/abc123/soap-note.json"
        );
    }
}
