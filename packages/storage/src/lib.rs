// ABOUTME: Persistence layer for the Sandchest control plane
// ABOUTME: Relational repositories over SQLite and durable blob storage over S3

pub mod models;
pub mod object_store;
pub mod repository;
pub mod sqlite;

pub use models::{
    Artifact, CollectedArtifact, Exec, ExecStatus, NewSandbox, Node, ResourceUsage, Sandbox,
    SandboxFilter, SandboxStatus, Session, SessionStatus,
};
pub use object_store::{
    artifact_key, exec_log_key, replay_log_key, sandbox_prefix, MemoryObjectStore, ObjectStore,
    ObjectStoreError, ObjectStoreResult, S3Config, S3ObjectStore,
};
pub use repository::{
    ArtifactRepository, ExecRepository, NodeRepository, Repository, SandboxRepository,
    SessionRepository,
};
pub use sqlite::SqliteRepository;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
