// ABOUTME: JSON response bodies returned by the public API
// ABOUTME: Converts storage models into tenant-facing views with RFC 3339 timestamps

use chrono::{DateTime, Utc};
use sandchest_core::format_timestamp;
use sandchest_sandbox::{ArtifactView, ExecOutcome, ForkTree, ReplayEvent};
use sandchest_storage::{Exec, ExecStatus, Sandbox, SandboxStatus, Session, SessionStatus};
use serde::Serialize;

fn ts(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.as_ref().map(format_timestamp)
}

pub fn replay_url(sandbox_id: &str) -> String {
    format!("/v1/sandboxes/{}/replay", sandbox_id)
}

#[derive(Debug, Serialize)]
pub struct SandboxResponse {
    pub sandbox_id: String,
    pub status: SandboxStatus,
    pub image: String,
    pub profile: String,
    pub forked_from: Option<String>,
    pub fork_depth: i32,
    pub fork_count: i32,
    pub ttl_seconds: i64,
    pub failure_reason: Option<String>,
    pub replay_public: bool,
    pub replay_url: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub expires_at: Option<String>,
    pub last_activity_at: Option<String>,
}

impl From<&Sandbox> for SandboxResponse {
    fn from(sandbox: &Sandbox) -> Self {
        Self {
            sandbox_id: sandbox.id.clone(),
            status: sandbox.status,
            image: sandbox.image.clone(),
            profile: sandbox.profile.clone(),
            forked_from: sandbox.forked_from.clone(),
            fork_depth: sandbox.fork_depth,
            fork_count: sandbox.fork_count,
            ttl_seconds: sandbox.ttl_seconds,
            failure_reason: sandbox.failure_reason.clone(),
            replay_public: sandbox.replay_public,
            replay_url: replay_url(&sandbox.id),
            created_at: format_timestamp(&sandbox.created_at),
            started_at: ts(&sandbox.started_at),
            ended_at: ts(&sandbox.ended_at),
            expires_at: ts(&sandbox.expires_at),
            last_activity_at: ts(&sandbox.last_activity_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SandboxList {
    pub sandboxes: Vec<SandboxResponse>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ForkTreeEntry {
    pub sandbox_id: String,
    pub status: SandboxStatus,
    pub forked_from: Option<String>,
    pub forked_at: Option<String>,
    pub children: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ForkTreeResponse {
    pub root: String,
    pub tree: Vec<ForkTreeEntry>,
}

impl From<ForkTree> for ForkTreeResponse {
    fn from(tree: ForkTree) -> Self {
        Self {
            root: tree.root,
            tree: tree
                .nodes
                .into_iter()
                .map(|node| ForkTreeEntry {
                    forked_at: node
                        .sandbox
                        .forked_from
                        .as_ref()
                        .map(|_| format_timestamp(&node.sandbox.created_at)),
                    sandbox_id: node.sandbox.id,
                    status: node.sandbox.status,
                    forked_from: node.sandbox.forked_from,
                    children: node.children,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecResponse {
    pub exec_id: String,
    pub sandbox_id: String,
    pub session_id: Option<String>,
    pub seq: i64,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<i64>,
    pub cpu_ms: Option<i64>,
    pub peak_memory_bytes: Option<i64>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

impl From<&Exec> for ExecResponse {
    fn from(exec: &Exec) -> Self {
        Self {
            exec_id: exec.id.clone(),
            sandbox_id: exec.sandbox_id.clone(),
            session_id: exec.session_id.clone(),
            seq: exec.seq,
            cmd: exec.cmd.clone(),
            cwd: exec.cwd.clone(),
            status: exec.status,
            exit_code: exec.exit_code,
            duration_ms: exec.duration_ms,
            cpu_ms: exec.usage.as_ref().map(|u| u.cpu_ms),
            peak_memory_bytes: exec.usage.as_ref().map(|u| u.peak_memory_bytes),
            created_at: format_timestamp(&exec.created_at),
            started_at: ts(&exec.started_at),
            ended_at: ts(&exec.ended_at),
        }
    }
}

/// Result of a command the caller waited on.
#[derive(Debug, Serialize)]
pub struct ExecResult {
    pub exec_id: String,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: Option<i64>,
}

impl From<ExecOutcome> for ExecResult {
    fn from(outcome: ExecOutcome) -> Self {
        Self {
            exec_id: outcome.exec.id,
            status: outcome.exec.status,
            exit_code: outcome.exec.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration_ms: outcome.exec.duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub shell: String,
    pub status: SessionStatus,
    pub created_at: String,
    pub destroyed_at: Option<String>,
}

impl From<&Session> for SessionResponse {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            shell: session.shell.clone(),
            status: session.status,
            created_at: format_timestamp(&session.created_at),
            destroyed_at: ts(&session.destroyed_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    pub id: String,
    pub name: String,
    pub path: String,
    pub mime: Option<String>,
    pub bytes: Option<i64>,
    pub sha256: Option<String>,
    pub download_url: Option<String>,
    pub exec_id: Option<String>,
    pub created_at: String,
    pub collected_at: Option<String>,
}

impl From<ArtifactView> for ArtifactResponse {
    fn from(view: ArtifactView) -> Self {
        let artifact = view.artifact;
        Self {
            created_at: format_timestamp(&artifact.created_at),
            collected_at: ts(&artifact.collected_at),
            id: artifact.id,
            name: artifact.name,
            path: artifact.path,
            mime: artifact.mime,
            bytes: artifact.bytes,
            sha256: artifact.sha256,
            download_url: view.download_url,
            exec_id: artifact.exec_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub sandbox_id: String,
    pub events: Vec<ReplayEvent>,
}
