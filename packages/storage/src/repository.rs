// ABOUTME: Repository traits over the relational store
// ABOUTME: Every status change is a conditional update so concurrent writers cannot regress state

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Artifact, CollectedArtifact, Exec, ExecStatus, Node, ResourceUsage, Sandbox, SandboxFilter,
    SandboxStatus, Session,
};
use crate::Result;

#[async_trait]
pub trait SandboxRepository: Send + Sync {
    async fn create_sandbox(&self, sandbox: &Sandbox) -> Result<()>;

    /// Insert a forked child and bump the parent's fork counter in one transaction.
    ///
    /// Returns the parent's new `fork_count`.
    async fn create_fork(&self, child: &Sandbox, parent_id: &str) -> Result<i32>;

    /// Fetch a sandbox by ID, `NotFound` if it does not exist.
    async fn get_sandbox(&self, id: &str) -> Result<Sandbox>;

    async fn list_sandboxes(&self, org_id: &str, filter: &SandboxFilter) -> Result<Vec<Sandbox>>;

    /// Move `id` to `to` only if its current status is one of `from`.
    ///
    /// Returns whether a row changed. Entering a terminal state sets
    /// `ended_at` once; `failure_reason` is kept from the first writer.
    async fn transition_status(
        &self,
        id: &str,
        from: &[SandboxStatus],
        to: SandboxStatus,
        failure_reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Bind a queued sandbox to a node slot and move it to `provisioning`.
    async fn assign_node(&self, id: &str, node_id: &str, slot: u32, at: DateTime<Utc>)
        -> Result<bool>;

    /// Mark a queued or provisioning sandbox as running and start its TTL clock.
    async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool>;

    async fn touch_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn set_replay_public(&self, id: &str, public: bool) -> Result<()>;

    /// The sandbox and all of its descendants, ordered by depth.
    async fn get_fork_tree(&self, root_id: &str) -> Result<Vec<Sandbox>>;

    async fn list_queued(&self, limit: u32) -> Result<Vec<Sandbox>>;

    /// Sandboxes that occupy a node slot: `provisioning`, `running` or `stopping`.
    async fn list_on_nodes(&self) -> Result<Vec<Sandbox>>;

    /// `provisioning` or `stopping` sandboxes that entered that state at or before `cutoff`.
    async fn find_stuck_transitions(&self, cutoff: DateTime<Utc>) -> Result<Vec<Sandbox>>;

    async fn find_expired_ttl(&self, now: DateTime<Utc>) -> Result<Vec<Sandbox>>;

    /// Running sandboxes expiring within `window_secs` that have not been warned yet.
    async fn find_near_ttl_expiry(&self, now: DateTime<Utc>, window_secs: i64)
        -> Result<Vec<Sandbox>>;

    async fn mark_ttl_warned(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Running sandboxes whose last activity predates `cutoff`.
    async fn find_idle_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Sandbox>>;

    /// Queued sandboxes whose queue deadline has passed.
    async fn find_queued_before(&self, now: DateTime<Utc>) -> Result<Vec<Sandbox>>;

    /// Terminal sandboxes without a replay retention deadline.
    async fn find_missing_replay_expiry(&self, limit: u32) -> Result<Vec<Sandbox>>;

    async fn set_replay_expiry(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Sandboxes past their replay retention that still hold replay data.
    async fn find_purgable_replays(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Sandbox>>;

    async fn mark_replay_purged(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait ExecRepository: Send + Sync {
    /// Insert an exec, assigning the next sandbox-scoped sequence number.
    async fn create_exec(&self, exec: &Exec) -> Result<Exec>;

    async fn get_exec(&self, sandbox_id: &str, exec_id: &str) -> Result<Exec>;

    async fn list_execs(&self, sandbox_id: &str) -> Result<Vec<Exec>>;

    async fn mark_exec_running(&self, exec_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn complete_exec(
        &self,
        exec_id: &str,
        status: ExecStatus,
        exit_code: Option<i32>,
        usage: Option<ResourceUsage>,
        duration_ms: i64,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<()>;

    async fn get_session(&self, sandbox_id: &str, session_id: &str) -> Result<Session>;

    async fn list_sessions(&self, sandbox_id: &str) -> Result<Vec<Session>>;

    /// Returns false if the session was already destroyed.
    async fn destroy_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool>;
}

#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// Register artifact paths, ignoring ones already registered.
    ///
    /// Returns `(newly_registered, total_registered)`.
    async fn register_artifacts(&self, artifacts: &[Artifact]) -> Result<(usize, usize)>;

    async fn count_artifacts(&self, sandbox_id: &str) -> Result<usize>;

    async fn list_artifacts(&self, sandbox_id: &str) -> Result<Vec<Artifact>>;

    async fn list_uncollected_artifacts(&self, sandbox_id: &str) -> Result<Vec<Artifact>>;

    async fn mark_artifact_collected(
        &self,
        artifact_id: &str,
        collected: &CollectedArtifact,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Insert or refresh a node row on heartbeat.
    async fn upsert_node(&self, node: &Node) -> Result<()>;

    async fn get_node(&self, id: &str) -> Result<Node>;

    /// Nodes that reported a heartbeat at or after `since`.
    async fn get_active_nodes(&self, since: DateTime<Utc>) -> Result<Vec<Node>>;
}

/// Everything the control plane persists, behind one handle.
pub trait Repository:
    SandboxRepository + ExecRepository + SessionRepository + ArtifactRepository + NodeRepository
{
}

impl<T> Repository for T where
    T: SandboxRepository + ExecRepository + SessionRepository + ArtifactRepository + NodeRepository
{
}
