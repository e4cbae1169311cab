// ABOUTME: Keyed blob storage for durable replay logs, exec output and artifacts
// ABOUTME: S3 in production, an in-process map for tests and single-node development

mod memory;
mod s3;

pub use memory::MemoryObjectStore;
pub use s3::{S3Config, S3ObjectStore};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object store request failed: {0}")]
    Backend(String),

    #[error("Invalid object store configuration: {0}")]
    Configuration(String),
}

pub type ObjectStoreResult<T> = std::result::Result<T, ObjectStoreError>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns `None` when the key does not exist.
    async fn get_object(&self, key: &str) -> ObjectStoreResult<Option<Vec<u8>>>;

    /// Create or overwrite the object at `key`.
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str)
        -> ObjectStoreResult<()>;

    /// Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> ObjectStoreResult<()>;

    /// Delete every object under `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> ObjectStoreResult<usize>;

    async fn get_presigned_url(&self, key: &str, expiry_secs: u64) -> ObjectStoreResult<String>;
}

/// Prefix holding everything recorded for one sandbox.
pub fn sandbox_prefix(org_id: &str, sandbox_id: &str) -> String {
    format!("{}/{}/", org_id, sandbox_id)
}

/// Durable newline-delimited event log of a sandbox.
pub fn replay_log_key(org_id: &str, sandbox_id: &str) -> String {
    format!("{}/{}/events.jsonl", org_id, sandbox_id)
}

/// Full output stream of one exec.
pub fn exec_log_key(org_id: &str, sandbox_id: &str, exec_id: &str) -> String {
    format!("{}/{}/exec/{}.log", org_id, sandbox_id, exec_id)
}

pub fn artifact_key(org_id: &str, sandbox_id: &str, artifact_id: &str, name: &str) -> String {
    format!("{}/{}/artifacts/{}/{}", org_id, sandbox_id, artifact_id, name)
}
