// ABOUTME: HTTP client for the node agent API
// ABOUTME: Resolves node addresses through a directory and streams exec output as NDJSON frames

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use reqwest::{Response, StatusCode};
use sandchest_storage::{NodeRepository, Repository, ResourceUsage, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{
    CollectedFile, ExecCompletion, ExecSpec, FileEntry, NodeClient, NodeError, NodeResult,
    OutputChunk, OutputSink, OutputStream, ProvisionSpec, SessionExecOutput,
};

/// Maps node IDs to base URLs.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn node_address(&self, node_id: &str) -> NodeResult<String>;
}

/// Addresses reported by node heartbeats.
pub struct RepositoryDirectory {
    repo: Arc<dyn Repository>,
}

impl RepositoryDirectory {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl NodeDirectory for RepositoryDirectory {
    async fn node_address(&self, node_id: &str) -> NodeResult<String> {
        match self.repo.get_node(node_id).await {
            Ok(node) => node
                .address
                .ok_or_else(|| NodeError::Unreachable(format!("node {} has no address", node_id))),
            Err(StorageError::NotFound(_)) => Err(NodeError::NotFound(format!("node {}", node_id))),
            Err(e) => Err(NodeError::Unreachable(e.to_string())),
        }
    }
}

/// Fixed node addresses, for single-node setups and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    addresses: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new(addresses: HashMap<String, String>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl NodeDirectory for StaticDirectory {
    async fn node_address(&self, node_id: &str) -> NodeResult<String> {
        self.addresses
            .get(node_id)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("node {}", node_id)))
    }
}

#[derive(Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
enum ExecFrame {
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Exit {
        exit_code: i32,
        duration_ms: i64,
        #[serde(default)]
        usage: ResourceUsage,
    },
}

#[derive(Serialize)]
struct ForkBody<'a> {
    dest_id: &'a str,
    env: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    session_id: &'a str,
    shell: &'a str,
    env: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct SessionExecBody<'a> {
    cmd: &'a str,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct SessionInputBody<'a> {
    data: &'a str,
}

#[derive(Deserialize)]
struct FileList {
    files: Vec<FileEntry>,
}

#[derive(Serialize)]
struct CollectBody<'a> {
    paths: &'a [String],
}

#[derive(Deserialize)]
struct CollectedWire {
    path: String,
    name: String,
    mime: String,
    sha256: String,
    /// Base64 file content.
    data: String,
}

#[derive(Deserialize)]
struct CollectResponse {
    artifacts: Vec<CollectedWire>,
}

pub struct HttpNodeClient {
    http: reqwest::Client,
    directory: Arc<dyn NodeDirectory>,
    request_timeout: Duration,
}

impl HttpNodeClient {
    pub fn new(directory: Arc<dyn NodeDirectory>, request_timeout: Duration) -> NodeResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| NodeError::Protocol(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            directory,
            request_timeout,
        })
    }

    async fn url(&self, node_id: &str, path: &str) -> NodeResult<String> {
        let base = self.directory.node_address(node_id).await?;
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }

    async fn check(response: Response) -> NodeResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(NodeError::NotFound(message));
        }
        Err(NodeError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

fn transport(err: reqwest::Error) -> NodeError {
    if err.is_timeout() {
        NodeError::Timeout(err.to_string())
    } else if err.is_decode() {
        NodeError::Protocol(err.to_string())
    } else {
        NodeError::Unreachable(err.to_string())
    }
}

fn sandbox_path(sandbox_id: &str, rest: &str) -> String {
    format!("/v1/sandboxes/{}{}", sandbox_id, rest)
}

/// Forward one NDJSON frame, returning the completion when it is the exit frame.
fn handle_frame(line: &[u8], output: &OutputSink) -> NodeResult<Option<ExecCompletion>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let frame: ExecFrame = serde_json::from_slice(line)
        .map_err(|e| NodeError::Protocol(format!("bad exec frame: {}", e)))?;

    let (stream, data) = match frame {
        ExecFrame::Stdout { data } => (OutputStream::Stdout, data),
        ExecFrame::Stderr { data } => (OutputStream::Stderr, data),
        ExecFrame::Exit {
            exit_code,
            duration_ms,
            usage,
        } => {
            return Ok(Some(ExecCompletion {
                exit_code,
                duration_ms,
                usage,
            }))
        }
    };
    // The receiver may have gone away; output is best-effort.
    let _ = output.send(OutputChunk { stream, data });
    Ok(None)
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn create_sandbox(&self, node_id: &str, spec: &ProvisionSpec) -> NodeResult<()> {
        let url = self.url(node_id, "/v1/sandboxes").await?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(spec)
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        debug!(node_id = %node_id, sandbox_id = %spec.sandbox_id, "Node booted sandbox");
        Ok(())
    }

    async fn destroy_sandbox(&self, node_id: &str, sandbox_id: &str) -> NodeResult<()> {
        let url = self.url(node_id, &sandbox_path(sandbox_id, "")).await?;
        let response = self
            .http
            .delete(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fork_sandbox(
        &self,
        node_id: &str,
        source_id: &str,
        dest_id: &str,
        env: &HashMap<String, String>,
    ) -> NodeResult<()> {
        let url = self.url(node_id, &sandbox_path(source_id, "/fork")).await?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(&ForkBody { dest_id, env })
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn exec(
        &self,
        node_id: &str,
        sandbox_id: &str,
        spec: &ExecSpec,
        output: OutputSink,
    ) -> NodeResult<ExecCompletion> {
        let url = self.url(node_id, &sandbox_path(sandbox_id, "/exec")).await?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout + Duration::from_secs(spec.timeout_secs))
            .json(spec)
            .send()
            .await
            .map_err(transport)?;
        let response = Self::check(response).await?;

        let mut body = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = body.next().await {
            pending.extend_from_slice(&chunk.map_err(transport)?);
            while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                if let Some(done) = handle_frame(&line, &output)? {
                    return Ok(done);
                }
            }
        }

        match handle_frame(&pending, &output)? {
            Some(done) => Ok(done),
            None => Err(NodeError::Protocol(
                "exec stream ended without exit frame".to_string(),
            )),
        }
    }

    async fn create_session(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        shell: &str,
        env: &HashMap<String, String>,
    ) -> NodeResult<()> {
        let url = self.url(node_id, &sandbox_path(sandbox_id, "/sessions")).await?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(&CreateSessionBody {
                session_id,
                shell,
                env,
            })
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn session_exec(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        cmd: &str,
        timeout_secs: u64,
    ) -> NodeResult<SessionExecOutput> {
        let path = sandbox_path(sandbox_id, &format!("/sessions/{}/exec", session_id));
        let url = self.url(node_id, &path).await?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout + Duration::from_secs(timeout_secs))
            .json(&SessionExecBody { cmd, timeout_secs })
            .send()
            .await
            .map_err(transport)?;
        Self::check(response)
            .await?
            .json::<SessionExecOutput>()
            .await
            .map_err(transport)
    }

    async fn session_input(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        data: &str,
    ) -> NodeResult<()> {
        let path = sandbox_path(sandbox_id, &format!("/sessions/{}/input", session_id));
        let url = self.url(node_id, &path).await?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(&SessionInputBody { data })
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn destroy_session(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
    ) -> NodeResult<()> {
        let path = sandbox_path(sandbox_id, &format!("/sessions/{}", session_id));
        let url = self.url(node_id, &path).await?;
        let response = self
            .http
            .delete(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn put_file(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
        content: Vec<u8>,
    ) -> NodeResult<()> {
        let url = self.url(node_id, &sandbox_path(sandbox_id, "/files")).await?;
        let response = self
            .http
            .put(url)
            .timeout(self.request_timeout)
            .query(&[("path", path)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<Vec<u8>> {
        let url = self.url(node_id, &sandbox_path(sandbox_id, "/files")).await?;
        let response = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .query(&[("path", path)])
            .send()
            .await
            .map_err(transport)?;
        let bytes = Self::check(response)
            .await?
            .bytes()
            .await
            .map_err(transport)?;
        Ok(bytes.to_vec())
    }

    async fn list_files(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
    ) -> NodeResult<Vec<FileEntry>> {
        let url = self.url(node_id, &sandbox_path(sandbox_id, "/files")).await?;
        let response = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .query(&[("path", path), ("list", "true")])
            .send()
            .await
            .map_err(transport)?;
        let list: FileList = Self::check(response)
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(list.files)
    }

    async fn delete_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<()> {
        let url = self.url(node_id, &sandbox_path(sandbox_id, "/files")).await?;
        let response = self
            .http
            .delete(url)
            .timeout(self.request_timeout)
            .query(&[("path", path)])
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn collect_artifacts(
        &self,
        node_id: &str,
        sandbox_id: &str,
        paths: &[String],
    ) -> NodeResult<Vec<CollectedFile>> {
        let url = self
            .url(node_id, &sandbox_path(sandbox_id, "/artifacts/collect"))
            .await?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(&CollectBody { paths })
            .send()
            .await
            .map_err(transport)?;
        let collected: CollectResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(transport)?;

        collected
            .artifacts
            .into_iter()
            .map(|wire| {
                let content = base64::engine::general_purpose::STANDARD
                    .decode(wire.data.as_bytes())
                    .map_err(|e| {
                        NodeError::Protocol(format!("artifact {} is not base64: {}", wire.path, e))
                    })?;
                Ok(CollectedFile {
                    path: wire.path,
                    name: wire.name,
                    mime: wire.mime,
                    sha256: wire.sha256,
                    content,
                })
            })
            .collect()
    }
}
