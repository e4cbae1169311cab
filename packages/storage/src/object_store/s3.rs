// ABOUTME: S3-compatible object store built on the AWS SDK
// ABOUTME: Works against AWS, R2 or MinIO through an optional custom endpoint

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use std::time::Duration;
use tracing::debug;

use super::{ObjectStore, ObjectStoreError, ObjectStoreResult};

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services.
    pub endpoint: Option<String>,
    /// Upper bound on one S3 operation, retries included.
    pub operation_timeout: Duration,
}

/// Per-operation and per-attempt limits so no S3 call waits unbounded.
fn timeout_config(operation_timeout: Duration) -> TimeoutConfig {
    TimeoutConfig::builder()
        .connect_timeout(operation_timeout.min(Duration::from_secs(5)))
        .operation_attempt_timeout(operation_timeout)
        .operation_timeout(operation_timeout)
        .build()
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS credential chain.
    pub async fn from_config(config: S3Config) -> ObjectStoreResult<Self> {
        if config.bucket.is_empty() {
            return Err(ObjectStoreError::Configuration(
                "bucket name must not be empty".to_string(),
            ));
        }
        if config.operation_timeout.is_zero() {
            return Err(ObjectStoreError::Configuration(
                "operation timeout must be positive".to_string(),
            ));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .timeout_config(timeout_config(config.operation_timeout));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn backend(op: &str, key: &str, err: impl std::fmt::Display) -> ObjectStoreError {
    ObjectStoreError::Backend(format!("{} {} failed: {}", op, key, err))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(&self, key: &str) -> ObjectStoreResult<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(backend("GetObject", key, service_err));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| backend("GetObject body", key, e))?;
        Ok(Some(body.into_bytes().to_vec()))
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> ObjectStoreResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes::Bytes::from(body)))
            .send()
            .await
            .map_err(|e| backend("PutObject", key, e))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> ObjectStoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend("DeleteObject", key, e))?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> ObjectStoreResult<usize> {
        let mut deleted = 0usize;
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| backend("ListObjectsV2", prefix, e))?;

            let identifiers = page
                .contents()
                .iter()
                .filter_map(|object| object.key())
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| backend("DeleteObjects", prefix, e))?;

            if !identifiers.is_empty() {
                let count = identifiers.len();
                let delete = Delete::builder()
                    .set_objects(Some(identifiers))
                    .quiet(true)
                    .build()
                    .map_err(|e| backend("DeleteObjects", prefix, e))?;

                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| backend("DeleteObjects", prefix, e))?;
                deleted += count;
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(prefix = %prefix, deleted, "Deleted objects under prefix");
        Ok(deleted)
    }

    async fn get_presigned_url(&self, key: &str, expiry_secs: u64) -> ObjectStoreResult<String> {
        let presigning = PresigningConfig::expires_in(Duration::from_secs(expiry_secs))
            .map_err(|e| backend("Presign", key, e))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| backend("Presign", key, e))?;

        Ok(request.uri().to_string())
    }
}
