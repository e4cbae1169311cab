// ABOUTME: Node-execution capability: the control plane's view of a worker node agent
// ABOUTME: Boots and destroys VMs, runs commands and sessions, moves files, forks and collects artifacts

use async_trait::async_trait;
use sandchest_storage::ResourceUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod http;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use http::{HttpNodeClient, NodeDirectory, RepositoryDirectory, StaticDirectory};

#[cfg(any(test, feature = "test-utils"))]
pub use fake::FakeNodeClient;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Node request timed out: {0}")]
    Timeout(String),

    #[error("Node rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Not found on node: {0}")]
    NotFound(String),

    #[error("Unexpected node response: {0}")]
    Protocol(String),
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// What a node needs to boot a fresh VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionSpec {
    pub sandbox_id: String,
    pub slot: u32,
    pub image: String,
    pub profile: String,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSpec {
    pub exec_id: String,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

/// Sender half handed to `exec`; chunks are forwarded as they arrive.
pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCompletion {
    pub exit_code: i32,
    pub duration_ms: i64,
    #[serde(default)]
    pub usage: ResourceUsage,
}

/// Buffered result of a command run inside a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size_bytes: Option<u64>,
}

/// One file gathered from a VM at stop time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedFile {
    pub path: String,
    pub name: String,
    pub mime: String,
    /// Hex digest as reported by the node.
    pub sha256: String,
    pub content: Vec<u8>,
}

/// Remote capability exposed by every worker node.
///
/// Calls are addressed by node ID; implementations resolve the transport.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn create_sandbox(&self, node_id: &str, spec: &ProvisionSpec) -> NodeResult<()>;

    async fn destroy_sandbox(&self, node_id: &str, sandbox_id: &str) -> NodeResult<()>;

    /// Clone the live VM `source_id` into `dest_id` on the same node.
    async fn fork_sandbox(
        &self,
        node_id: &str,
        source_id: &str,
        dest_id: &str,
        env: &HashMap<String, String>,
    ) -> NodeResult<()>;

    /// Run a command to completion, streaming output into `output`.
    async fn exec(
        &self,
        node_id: &str,
        sandbox_id: &str,
        spec: &ExecSpec,
        output: OutputSink,
    ) -> NodeResult<ExecCompletion>;

    async fn create_session(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        shell: &str,
        env: &HashMap<String, String>,
    ) -> NodeResult<()>;

    async fn session_exec(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        cmd: &str,
        timeout_secs: u64,
    ) -> NodeResult<SessionExecOutput>;

    async fn session_input(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        data: &str,
    ) -> NodeResult<()>;

    async fn destroy_session(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
    ) -> NodeResult<()>;

    async fn put_file(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
        content: Vec<u8>,
    ) -> NodeResult<()>;

    async fn get_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<Vec<u8>>;

    async fn list_files(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
    ) -> NodeResult<Vec<FileEntry>>;

    async fn delete_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<()>;

    /// Gather the given paths; paths that do not exist are omitted from the result.
    async fn collect_artifacts(
        &self,
        node_id: &str,
        sandbox_id: &str,
        paths: &[String],
    ) -> NodeResult<Vec<CollectedFile>>;
}
