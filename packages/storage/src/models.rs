// ABOUTME: Domain records persisted by the relational store
// ABOUTME: Sandboxes, execs, sessions, artifacts and worker nodes with their status machines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Queued,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
    Deleted,
}

impl SandboxStatus {
    pub const NON_TERMINAL: [SandboxStatus; 4] = [
        SandboxStatus::Queued,
        SandboxStatus::Provisioning,
        SandboxStatus::Running,
        SandboxStatus::Stopping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "provisioning" => Ok(Self::Provisioning),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Deleted)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `provisioning` may be skipped on the way to `running`, and `deleted`
    /// is reachable from every non-terminal state.
    pub fn can_transition_to(&self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Deleted || next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Queued, Provisioning)
                | (Queued, Running)
                | (Provisioning, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Every state from which `next` can be entered.
    pub fn sources_of(next: SandboxStatus) -> Vec<SandboxStatus> {
        Self::NON_TERMINAL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub org_id: String,
    pub node_id: Option<String>,
    pub slot: Option<u32>,
    pub image: String,
    pub profile: String,
    pub status: SandboxStatus,
    #[serde(skip_serializing, default)]
    pub env: HashMap<String, String>,

    // Fork lineage
    pub forked_from: Option<String>,
    pub fork_depth: i32,
    pub fork_count: i32,

    // Lifetime
    pub ttl_seconds: i64,
    pub queue_timeout_seconds: i64,
    pub failure_reason: Option<String>,

    // Replay
    pub replay_public: bool,
    pub replay_expires_at: Option<DateTime<Utc>>,
    pub replay_purged_at: Option<DateTime<Utc>>,

    // Timestamps
    pub last_activity_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub queue_deadline_at: DateTime<Utc>,
    pub ttl_warned_at: Option<DateTime<Utc>>,
}

/// Creation parameters for a fresh (non-forked) sandbox.
#[derive(Debug, Clone)]
pub struct NewSandbox {
    pub id: String,
    pub org_id: String,
    pub image: String,
    pub profile: String,
    pub env: HashMap<String, String>,
    pub ttl_seconds: i64,
    pub queue_timeout_seconds: i64,
}

impl Sandbox {
    /// A root sandbox waiting for placement.
    pub fn queued(new: NewSandbox, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            org_id: new.org_id,
            node_id: None,
            slot: None,
            image: new.image,
            profile: new.profile,
            status: SandboxStatus::Queued,
            env: new.env,
            forked_from: None,
            fork_depth: 0,
            fork_count: 0,
            ttl_seconds: new.ttl_seconds,
            queue_timeout_seconds: new.queue_timeout_seconds,
            failure_reason: None,
            replay_public: false,
            replay_expires_at: None,
            replay_purged_at: None,
            last_activity_at: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            expires_at: None,
            queue_deadline_at: now + chrono::Duration::seconds(new.queue_timeout_seconds),
            ttl_warned_at: None,
        }
    }

    /// A running child cloned from `parent` onto the parent's node.
    pub fn forked_from(parent: &Sandbox, id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            org_id: parent.org_id.clone(),
            node_id: parent.node_id.clone(),
            slot: None,
            image: parent.image.clone(),
            profile: parent.profile.clone(),
            status: SandboxStatus::Running,
            env: parent.env.clone(),
            forked_from: Some(parent.id.clone()),
            fork_depth: parent.fork_depth + 1,
            fork_count: 0,
            ttl_seconds: parent.ttl_seconds,
            queue_timeout_seconds: parent.queue_timeout_seconds,
            failure_reason: None,
            replay_public: false,
            replay_expires_at: None,
            replay_purged_at: None,
            last_activity_at: Some(now),
            created_at: now,
            started_at: Some(now),
            ended_at: None,
            expires_at: Some(now + chrono::Duration::seconds(parent.ttl_seconds)),
            queue_deadline_at: now,
            ttl_warned_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Queued,
    Running,
    Done,
    Failed,
    TimedOut,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::TimedOut)
    }
}

/// Resources consumed by one command invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_ms: i64,
    pub peak_memory_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exec {
    pub id: String,
    pub sandbox_id: String,
    pub org_id: String,
    pub session_id: Option<String>,
    /// Sandbox-scoped, assigned by the repository as max existing + 1.
    pub seq: i64,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub usage: Option<ResourceUsage>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Destroyed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Destroyed => "destroyed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "destroyed" => Ok(Self::Destroyed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub sandbox_id: String,
    pub org_id: String,
    pub shell: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub sandbox_id: String,
    pub org_id: String,
    pub path: String,
    pub name: String,
    pub mime: Option<String>,
    pub bytes: Option<i64>,
    pub sha256: Option<String>,
    pub object_ref: Option<String>,
    pub exec_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub collected_at: Option<DateTime<Utc>>,
}

/// Outcome of collecting one registered artifact path.
#[derive(Debug, Clone)]
pub struct CollectedArtifact {
    pub mime: String,
    pub bytes: i64,
    pub sha256: String,
    pub object_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: Option<String>,
    pub slots_total: u32,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Filters for listing a tenant's sandboxes.
#[derive(Debug, Clone, Default)]
pub struct SandboxFilter {
    pub status: Option<SandboxStatus>,
    pub image: Option<String>,
    pub forked_from: Option<String>,
    /// Return sandboxes created before this ID (IDs are time ordered).
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}
