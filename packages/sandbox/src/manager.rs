// ABOUTME: Sandbox lifecycle manager: the state machine, fork manager and tenant-facing operations
// ABOUTME: Orchestrates repository transitions, slot leases, node calls and post-commit replay events

use chrono::Duration as ChronoDuration;
use sandchest_coordination::{CoordinationError, CoordinationStore, LeaseManager};
use sandchest_core::constants::{
    ARTIFACT_URL_EXPIRY_SECS, DEFAULT_EXEC_TIMEOUT_SECS, DEFAULT_IMAGE, DEFAULT_PROFILE,
    DEFAULT_QUEUE_TIMEOUT_SECS, DEFAULT_SHELL, DEFAULT_TTL_SECS, FAILURE_PROVISION_FAILED,
    FAILURE_SANDBOX_DELETED, MAX_ARTIFACT_PATHS, MAX_EXEC_TIMEOUT_SECS, MAX_TTL_SECS, PROFILES,
};
use sandchest_core::{generate_id, Clock, IdKind};
use sandchest_storage::{
    artifact_key, Artifact, ArtifactRepository, CollectedArtifact, Exec, ExecRepository,
    ExecStatus, NewSandbox, Node, NodeRepository, ObjectStore, ObjectStoreError, Repository,
    Sandbox, SandboxFilter, SandboxRepository, SandboxStatus, Session, SessionRepository,
    SessionStatus, StorageError,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::node::{
    ExecSpec, FileEntry, NodeClient, NodeError, OutputChunk, OutputStream, ProvisionSpec,
    SessionExecOutput,
};
use crate::replay::{redact_env, ReplayError, ReplayEvent, ReplayNotifier, ReplayRecorder, ReplayTarget};
use crate::scheduler::Scheduler;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sandbox is not running: {0}")]
    SandboxNotRunning(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No capacity available: {0}")]
    CapacityUnavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<StorageError> for ManagerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => ManagerError::NotFound(what),
            other => ManagerError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// Limits and defaults applied by the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_fork_depth: i32,
    pub default_ttl_secs: i64,
    pub max_ttl_secs: i64,
    pub default_queue_timeout_secs: i64,
    pub node_heartbeat_ttl_secs: u64,
    /// Upper bound on waiting for a replay flush during stop.
    pub flush_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_fork_depth: 16,
            default_ttl_secs: DEFAULT_TTL_SECS,
            max_ttl_secs: MAX_TTL_SECS,
            default_queue_timeout_secs: DEFAULT_QUEUE_TIMEOUT_SECS,
            node_heartbeat_ttl_secs: 45,
            flush_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateSandboxRequest {
    pub org_id: String,
    pub image: Option<String>,
    pub profile: Option<String>,
    pub env: HashMap<String, String>,
    pub ttl_seconds: Option<i64>,
    pub queue_timeout_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ForkRequest {
    pub env: HashMap<String, String>,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout_secs: Option<u64>,
    pub wait: bool,
}

/// An exec row plus whatever output was captured while waiting on it.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exec: Exec,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ForkTreeNode {
    pub sandbox: Sandbox,
    pub children: Vec<String>,
}

/// A tenant's view of one fork family, root first, breadth first.
#[derive(Debug, Clone)]
pub struct ForkTree {
    pub root: String,
    pub nodes: Vec<ForkTreeNode>,
}

#[derive(Debug, Clone)]
pub struct ArtifactView {
    pub artifact: Artifact,
    pub download_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NodeHeartbeat {
    pub node_id: String,
    pub address: Option<String>,
    pub slots_total: u32,
    pub active_sandbox_ids: Vec<String>,
}

/// Everything the manager needs, injected at construction.
pub struct ManagerDeps {
    pub repo: Arc<dyn Repository>,
    pub nodes: Arc<dyn NodeClient>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub leases: LeaseManager,
    pub objects: Arc<dyn ObjectStore>,
    pub recorder: Arc<ReplayRecorder>,
    pub notifier: ReplayNotifier,
    pub clock: Arc<dyn Clock>,
}

/// Sandbox lifecycle manager
///
/// Every status change is a conditional repository update, so concurrent
/// callers and reapers on other instances cannot move a sandbox backwards.
/// Replay events are queued after the change commits and never fail it.
#[derive(Clone)]
pub struct SandboxManager {
    repo: Arc<dyn Repository>,
    nodes: Arc<dyn NodeClient>,
    coordination: Arc<dyn CoordinationStore>,
    leases: LeaseManager,
    scheduler: Scheduler,
    objects: Arc<dyn ObjectStore>,
    recorder: Arc<ReplayRecorder>,
    notifier: ReplayNotifier,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
}

fn target(sandbox: &Sandbox) -> ReplayTarget {
    ReplayTarget::from(sandbox)
}

fn base_name(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ManagerError::Validation(format!(
            "path must be absolute: {}",
            path
        )));
    }
    if path.split('/').any(|part| part == "..") {
        return Err(ManagerError::Validation(format!(
            "path must not contain '..': {}",
            path
        )));
    }
    Ok(())
}

impl SandboxManager {
    pub fn new(deps: ManagerDeps, config: ManagerConfig) -> Self {
        let scheduler = Scheduler::new(
            deps.repo.clone(),
            deps.coordination.clone(),
            deps.leases.clone(),
            deps.clock.clone(),
            config.node_heartbeat_ttl_secs,
        );
        Self {
            repo: deps.repo,
            nodes: deps.nodes,
            coordination: deps.coordination,
            leases: deps.leases,
            scheduler,
            objects: deps.objects,
            recorder: deps.recorder,
            notifier: deps.notifier,
            clock: deps.clock,
            config,
        }
    }

    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn coordination(&self) -> &Arc<dyn CoordinationStore> {
        &self.coordination
    }

    pub fn recorder(&self) -> &Arc<ReplayRecorder> {
        &self.recorder
    }

    pub fn notifier(&self) -> &ReplayNotifier {
        &self.notifier
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Queue a replay event for `sandbox`.
    pub fn record(&self, sandbox: &Sandbox, kind: &str, data: Value) {
        self.notifier.record(&target(sandbox), kind, data);
    }

    fn resolve_ttl(&self, ttl_seconds: Option<i64>, default: i64) -> Result<i64> {
        let ttl = ttl_seconds.unwrap_or(default);
        if ttl <= 0 || ttl > self.config.max_ttl_secs {
            return Err(ManagerError::Validation(format!(
                "ttl_seconds must be between 1 and {}",
                self.config.max_ttl_secs
            )));
        }
        Ok(ttl)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Insert a queued sandbox and try to place it right away.
    pub async fn create(&self, request: CreateSandboxRequest) -> Result<Sandbox> {
        let image = request
            .image
            .filter(|i| !i.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let profile = request
            .profile
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        if !PROFILES.contains(&profile.as_str()) {
            return Err(ManagerError::Validation(format!(
                "unknown profile '{}', expected one of {}",
                profile,
                PROFILES.join(", ")
            )));
        }
        let ttl_seconds = self.resolve_ttl(request.ttl_seconds, self.config.default_ttl_secs)?;
        let queue_timeout_seconds = request
            .queue_timeout_seconds
            .unwrap_or(self.config.default_queue_timeout_secs);
        if queue_timeout_seconds <= 0 {
            return Err(ManagerError::Validation(
                "queue_timeout_seconds must be positive".to_string(),
            ));
        }

        let sandbox = Sandbox::queued(
            NewSandbox {
                id: generate_id(IdKind::Sandbox),
                org_id: request.org_id,
                image,
                profile,
                env: request.env,
                ttl_seconds,
                queue_timeout_seconds,
            },
            self.clock.now(),
        );
        self.repo.create_sandbox(&sandbox).await?;

        info!(
            sandbox_id = %sandbox.id,
            org_id = %sandbox.org_id,
            image = %sandbox.image,
            profile = %sandbox.profile,
            "Sandbox created"
        );
        self.record(
            &sandbox,
            "sandbox.created",
            json!({
                "image": sandbox.image,
                "profile": sandbox.profile,
                "env": redact_env(&sandbox.env),
                "ttl_seconds": sandbox.ttl_seconds,
            }),
        );

        self.schedule(&sandbox).await
    }

    /// Try to move a queued sandbox onto a node.
    ///
    /// Returns the sandbox unchanged when there is no capacity. A node boot
    /// failure fails the sandbox and frees its slot.
    pub async fn schedule(&self, sandbox: &Sandbox) -> Result<Sandbox> {
        if sandbox.status != SandboxStatus::Queued {
            return Ok(sandbox.clone());
        }

        let Some(placement) = self.scheduler.place(&sandbox.id).await? else {
            return Ok(sandbox.clone());
        };

        if !self
            .repo
            .assign_node(&sandbox.id, &placement.node_id, placement.slot, self.clock.now())
            .await?
        {
            self.leases
                .release(&placement.node_id, placement.slot)
                .await?;
            return Ok(self.repo.get_sandbox(&sandbox.id).await?);
        }
        self.record(
            sandbox,
            "sandbox.provisioning",
            json!({ "node_id": placement.node_id, "slot": placement.slot }),
        );

        let spec = ProvisionSpec {
            sandbox_id: sandbox.id.clone(),
            slot: placement.slot,
            image: sandbox.image.clone(),
            profile: sandbox.profile.clone(),
            env: sandbox.env.clone(),
        };
        if let Err(e) = self.nodes.create_sandbox(&placement.node_id, &spec).await {
            warn!(
                sandbox_id = %sandbox.id,
                node_id = %placement.node_id,
                error = %e,
                "Node failed to boot sandbox"
            );
            let provisioning = self.repo.get_sandbox(&sandbox.id).await?;
            self.fail(&provisioning, FAILURE_PROVISION_FAILED).await?;
            return Ok(self.repo.get_sandbox(&sandbox.id).await?);
        }

        if self.repo.mark_running(&sandbox.id, self.clock.now()).await? {
            let running = self.repo.get_sandbox(&sandbox.id).await?;
            info!(
                sandbox_id = %running.id,
                node_id = %placement.node_id,
                slot = placement.slot,
                "Sandbox running"
            );
            self.record(&running, "sandbox.running", json!({ "node_id": placement.node_id }));
            return Ok(running);
        }

        // Deleted or failed while the node was booting it.
        let current = self.repo.get_sandbox(&sandbox.id).await?;
        self.finalize(&current, true).await;
        Ok(current)
    }

    /// Fetch a sandbox owned by `org_id`. Other tenants' sandboxes are reported missing.
    pub async fn get(&self, org_id: &str, sandbox_id: &str) -> Result<Sandbox> {
        let sandbox = self.repo.get_sandbox(sandbox_id).await?;
        if sandbox.org_id != org_id {
            return Err(ManagerError::NotFound(sandbox_id.to_string()));
        }
        Ok(sandbox)
    }

    pub async fn list(&self, org_id: &str, filter: &SandboxFilter) -> Result<Vec<Sandbox>> {
        Ok(self.repo.list_sandboxes(org_id, filter).await?)
    }

    async fn running(&self, org_id: &str, sandbox_id: &str) -> Result<Sandbox> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        if sandbox.status != SandboxStatus::Running {
            return Err(ManagerError::SandboxNotRunning(format!(
                "{} is {}",
                sandbox.id, sandbox.status
            )));
        }
        Ok(sandbox)
    }

    fn node_of(sandbox: &Sandbox) -> Result<&str> {
        sandbox
            .node_id
            .as_deref()
            .ok_or_else(|| ManagerError::Conflict(format!("{} has no node", sandbox.id)))
    }

    /// Clone a running sandbox into a new running child on the same node.
    pub async fn fork(&self, org_id: &str, parent_id: &str, request: ForkRequest) -> Result<Sandbox> {
        let parent = self.running(org_id, parent_id).await?;
        if parent.fork_depth + 1 > self.config.max_fork_depth {
            return Err(ManagerError::Validation(format!(
                "fork depth limit of {} reached",
                self.config.max_fork_depth
            )));
        }
        let node_id = Self::node_of(&parent)?.to_string();
        let ttl_seconds = self.resolve_ttl(request.ttl_seconds, parent.ttl_seconds)?;

        let now = self.clock.now();
        let mut child = Sandbox::forked_from(&parent, generate_id(IdKind::Sandbox), now);
        child.ttl_seconds = ttl_seconds;
        child.expires_at = Some(now + ChronoDuration::seconds(ttl_seconds));
        child.env.extend(request.env.clone());

        let node = self.repo.get_node(&node_id).await?;
        let Some(slot) = self
            .leases
            .acquire_any(&node_id, node.slots_total, &child.id)
            .await?
        else {
            info!(sandbox_id = %parent.id, node_id = %node_id, "Fork rejected, node is full");
            return Err(ManagerError::CapacityUnavailable(format!(
                "node {} has no free slot",
                node_id
            )));
        };
        child.slot = Some(slot);

        if let Err(e) = self
            .nodes
            .fork_sandbox(&node_id, &parent.id, &child.id, &request.env)
            .await
        {
            self.release_lease(&node_id, slot).await;
            return Err(e.into());
        }

        let fork_count = match self.repo.create_fork(&child, &parent.id).await {
            Ok(count) => count,
            Err(e) => {
                self.release_lease(&node_id, slot).await;
                self.destroy_vm(&node_id, &child.id).await;
                return Err(e.into());
            }
        };
        self.repo.touch_activity(&parent.id, now).await?;

        info!(
            sandbox_id = %child.id,
            forked_from = %parent.id,
            fork_depth = child.fork_depth,
            "Sandbox forked"
        );
        self.record(
            &parent,
            "sandbox.forked",
            json!({ "child_id": child.id, "fork_count": fork_count }),
        );
        self.record(
            &child,
            "sandbox.created",
            json!({
                "forked_from": parent.id,
                "fork_depth": child.fork_depth,
                "env": redact_env(&child.env),
                "ttl_seconds": child.ttl_seconds,
            }),
        );

        Ok(child)
    }

    /// The fork family containing `sandbox_id`, restricted to `org_id`.
    pub async fn fork_tree(&self, org_id: &str, sandbox_id: &str) -> Result<ForkTree> {
        let start = self.get(org_id, sandbox_id).await?;

        // Lineage depth bounds the walk; the tree is acyclic by construction.
        let mut root = start.clone();
        for _ in 0..=start.fork_depth {
            let Some(parent_id) = root.forked_from.clone() else {
                break;
            };
            let parent = self.repo.get_sandbox(&parent_id).await?;
            if parent.org_id != org_id {
                warn!(
                    sandbox_id = %root.id,
                    ancestor_id = %parent.id,
                    org_id = %org_id,
                    audit = true,
                    "Foreign-tenant ancestor dropped from fork tree"
                );
                break;
            }
            root = parent;
        }

        let family = self.repo.get_fork_tree(&root.id).await?;
        let mut by_parent: HashMap<String, Vec<Sandbox>> = HashMap::new();
        for sandbox in family {
            if sandbox.id == root.id {
                continue;
            }
            if let Some(parent_id) = sandbox.forked_from.clone() {
                by_parent.entry(parent_id).or_default().push(sandbox);
            }
        }

        let mut nodes = Vec::new();
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(sandbox) = queue.pop_front() {
            let mut children = Vec::new();
            for child in by_parent.remove(&sandbox.id).unwrap_or_default() {
                if child.org_id != org_id {
                    warn!(
                        sandbox_id = %child.id,
                        forked_from = %sandbox.id,
                        org_id = %org_id,
                        audit = true,
                        "Foreign-tenant descendant dropped from fork tree"
                    );
                    continue;
                }
                children.push(child.id.clone());
                queue.push_back(child);
            }
            nodes.push(ForkTreeNode { sandbox, children });
        }

        Ok(ForkTree {
            root: root.id,
            nodes,
        })
    }

    /// Stop a running sandbox. Anything else is returned unchanged.
    pub async fn stop(&self, org_id: &str, sandbox_id: &str) -> Result<Sandbox> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        self.stop_sandbox(&sandbox, None).await
    }

    /// `running -> stopping`, collect artifacts, flush replay, then `stopped`.
    pub async fn stop_sandbox(&self, sandbox: &Sandbox, reason: Option<&str>) -> Result<Sandbox> {
        if sandbox.status != SandboxStatus::Running {
            return Ok(sandbox.clone());
        }

        let now = self.clock.now();
        if !self
            .repo
            .transition_status(&sandbox.id, &[SandboxStatus::Running], SandboxStatus::Stopping, None, now)
            .await?
        {
            return Ok(self.repo.get_sandbox(&sandbox.id).await?);
        }
        self.record(sandbox, "sandbox.stopping", json!({ "reason": reason }));

        if let Err(e) = self.collect_artifacts(sandbox).await {
            warn!(sandbox_id = %sandbox.id, error = %e, "Artifact collection failed during stop");
        }
        self.flush_replay(&sandbox.id, false).await;

        let stopped = self
            .repo
            .transition_status(
                &sandbox.id,
                &[SandboxStatus::Stopping],
                SandboxStatus::Stopped,
                reason,
                self.clock.now(),
            )
            .await?;
        let current = self.repo.get_sandbox(&sandbox.id).await?;
        if stopped {
            info!(sandbox_id = %current.id, reason = ?reason, "Sandbox stopped");
            self.record(&current, "sandbox.stopped", json!({ "reason": reason }));
        }
        self.finalize(&current, true).await;
        Ok(current)
    }

    /// Delete a sandbox. Already-terminal sandboxes are returned unchanged.
    pub async fn delete(&self, org_id: &str, sandbox_id: &str) -> Result<Sandbox> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        if sandbox.status.is_terminal() {
            return Ok(sandbox);
        }

        let deleted = self
            .repo
            .transition_status(
                &sandbox.id,
                &SandboxStatus::NON_TERMINAL,
                SandboxStatus::Deleted,
                Some(FAILURE_SANDBOX_DELETED),
                self.clock.now(),
            )
            .await?;
        let current = self.repo.get_sandbox(&sandbox.id).await?;
        if deleted {
            info!(sandbox_id = %current.id, org_id = %org_id, "Sandbox deleted");
            self.record(&current, "sandbox.deleted", json!({ "previous_status": sandbox.status }));
            self.finalize(&current, sandbox.status != SandboxStatus::Queued).await;
        }
        Ok(current)
    }

    /// Move any non-terminal sandbox to `failed` with `reason`.
    pub async fn fail(&self, sandbox: &Sandbox, reason: &str) -> Result<bool> {
        let failed = self
            .repo
            .transition_status(
                &sandbox.id,
                &SandboxStatus::NON_TERMINAL,
                SandboxStatus::Failed,
                Some(reason),
                self.clock.now(),
            )
            .await?;
        if failed {
            warn!(sandbox_id = %sandbox.id, reason = %reason, "Sandbox failed");
            self.record(sandbox, "sandbox.failed", json!({ "reason": reason }));
            self.finalize(sandbox, sandbox.status != SandboxStatus::Queued).await;
        }
        Ok(failed)
    }

    /// Release what a terminal sandbox held. Every step is best effort.
    async fn finalize(&self, sandbox: &Sandbox, destroy_vm: bool) {
        if let (Some(node_id), Some(slot)) = (sandbox.node_id.as_deref(), sandbox.slot) {
            if let Err(e) = self.leases.release_held(node_id, slot, &sandbox.id).await {
                warn!(node_id = %node_id, slot, error = %e, "Slot lease release failed, waiting for expiry");
            }
        }
        if destroy_vm {
            if let Some(node_id) = sandbox.node_id.as_deref() {
                self.destroy_vm(node_id, &sandbox.id).await;
            }
        }
        self.notifier.flush(&sandbox.id, true);
    }

    async fn release_lease(&self, node_id: &str, slot: u32) {
        if let Err(e) = self.leases.release(node_id, slot).await {
            warn!(node_id = %node_id, slot, error = %e, "Slot lease release failed, waiting for expiry");
        }
    }

    async fn destroy_vm(&self, node_id: &str, sandbox_id: &str) {
        if let Err(e) = self.nodes.destroy_sandbox(node_id, sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, node_id = %node_id, error = %e, "VM teardown failed");
        }
    }

    async fn flush_replay(&self, sandbox_id: &str, release: bool) {
        let wait = Duration::from_secs(self.config.flush_timeout_secs);
        if tokio::time::timeout(wait, self.notifier.flush_and_wait(sandbox_id, release))
            .await
            .is_err()
        {
            warn!(sandbox_id = %sandbox_id, replay_record_failed = true, "Replay flush timed out");
        }
    }

    // ------------------------------------------------------------------
    // Exec
    // ------------------------------------------------------------------

    /// Start a command. With `wait` the call returns after it finishes.
    pub async fn exec(&self, org_id: &str, sandbox_id: &str, request: ExecRequest) -> Result<ExecOutcome> {
        if request.cmd.is_empty() || request.cmd[0].trim().is_empty() {
            return Err(ManagerError::Validation("cmd must not be empty".to_string()));
        }
        let timeout_secs = request.timeout_secs.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS);
        if timeout_secs == 0 || timeout_secs > MAX_EXEC_TIMEOUT_SECS {
            return Err(ManagerError::Validation(format!(
                "timeout_seconds must be between 1 and {}",
                MAX_EXEC_TIMEOUT_SECS
            )));
        }

        let sandbox = self.running(org_id, sandbox_id).await?;
        let now = self.clock.now();
        let exec = self
            .repo
            .create_exec(&Exec {
                id: generate_id(IdKind::Exec),
                sandbox_id: sandbox.id.clone(),
                org_id: sandbox.org_id.clone(),
                session_id: None,
                seq: 0,
                cmd: request.cmd.clone(),
                cwd: request.cwd.clone(),
                status: ExecStatus::Queued,
                exit_code: None,
                usage: None,
                duration_ms: None,
                created_at: now,
                started_at: None,
                ended_at: None,
            })
            .await?;
        self.repo.touch_activity(&sandbox.id, now).await?;

        let spec = ExecSpec {
            exec_id: exec.id.clone(),
            cmd: request.cmd,
            cwd: request.cwd,
            env: request.env,
            timeout_secs,
        };

        if request.wait {
            return self.run_exec(sandbox, exec, spec).await;
        }

        let manager = self.clone();
        let queued = exec.clone();
        tokio::spawn(async move {
            let exec_id = exec.id.clone();
            if let Err(e) = manager.run_exec(sandbox, exec, spec).await {
                warn!(exec_id = %exec_id, error = %e, "Background exec bookkeeping failed");
            }
        });
        Ok(ExecOutcome {
            exec: queued,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn run_exec(&self, sandbox: Sandbox, exec: Exec, spec: ExecSpec) -> Result<ExecOutcome> {
        let replay = target(&sandbox);
        let node_id = Self::node_of(&sandbox)?.to_string();

        self.repo.mark_exec_running(&exec.id, self.clock.now()).await?;
        self.notifier.record(
            &replay,
            "exec.started",
            json!({ "exec_id": exec.id, "seq": exec.seq, "cmd": spec.cmd, "cwd": spec.cwd }),
        );

        let (sink, mut chunks) = mpsc::unbounded_channel::<OutputChunk>();
        let notifier = self.notifier.clone();
        let collector_target = replay.clone();
        let exec_id = exec.id.clone();
        let collector = tokio::spawn(async move {
            let mut stdout = String::new();
            let mut stderr = String::new();
            while let Some(chunk) = chunks.recv().await {
                match chunk.stream {
                    OutputStream::Stdout => stdout.push_str(&chunk.data),
                    OutputStream::Stderr => stderr.push_str(&chunk.data),
                }
                notifier.exec_output(&collector_target, &exec_id, chunk.stream, chunk.data);
            }
            (stdout, stderr)
        });

        let started = Instant::now();
        let deadline = Duration::from_secs(spec.timeout_secs);
        let result = tokio::time::timeout(deadline, self.nodes.exec(&node_id, &sandbox.id, &spec, sink)).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let (status, exit_code, usage, duration_ms) = match result {
            Ok(Ok(done)) => (ExecStatus::Done, Some(done.exit_code), Some(done.usage), done.duration_ms),
            Ok(Err(e)) => {
                warn!(exec_id = %exec.id, sandbox_id = %sandbox.id, error = %e, "Exec failed on node");
                (ExecStatus::Failed, None, None, elapsed_ms)
            }
            Err(_) => {
                info!(exec_id = %exec.id, sandbox_id = %sandbox.id, timeout_secs = spec.timeout_secs, "Exec timed out");
                (ExecStatus::TimedOut, None, None, elapsed_ms)
            }
        };
        let (stdout, stderr) = collector.await.unwrap_or_default();

        let now = self.clock.now();
        self.repo
            .complete_exec(&exec.id, status, exit_code, usage, duration_ms, now)
            .await?;
        self.repo.touch_activity(&sandbox.id, now).await?;
        self.notifier.record(
            &replay,
            "exec.completed",
            json!({
                "exec_id": exec.id,
                "status": status,
                "exit_code": exit_code,
                "duration_ms": duration_ms,
            }),
        );

        Ok(ExecOutcome {
            exec: self.repo.get_exec(&sandbox.id, &exec.id).await?,
            stdout,
            stderr,
        })
    }

    pub async fn get_exec(&self, org_id: &str, sandbox_id: &str, exec_id: &str) -> Result<Exec> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        Ok(self.repo.get_exec(&sandbox.id, exec_id).await?)
    }

    pub async fn list_execs(&self, org_id: &str, sandbox_id: &str) -> Result<Vec<Exec>> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        Ok(self.repo.list_execs(&sandbox.id).await?)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn create_session(
        &self,
        org_id: &str,
        sandbox_id: &str,
        shell: Option<String>,
        env: HashMap<String, String>,
    ) -> Result<Session> {
        let sandbox = self.running(org_id, sandbox_id).await?;
        let node_id = Self::node_of(&sandbox)?;
        let shell = shell.unwrap_or_else(|| DEFAULT_SHELL.to_string());
        let now = self.clock.now();
        let session = Session {
            id: generate_id(IdKind::Session),
            sandbox_id: sandbox.id.clone(),
            org_id: sandbox.org_id.clone(),
            shell,
            status: SessionStatus::Running,
            created_at: now,
            destroyed_at: None,
        };

        self.nodes
            .create_session(node_id, &sandbox.id, &session.id, &session.shell, &env)
            .await?;
        self.repo.create_session(&session).await?;
        self.repo.touch_activity(&sandbox.id, now).await?;
        self.record(
            &sandbox,
            "session.created",
            json!({ "session_id": session.id, "shell": session.shell, "env": redact_env(&env) }),
        );
        Ok(session)
    }

    async fn live_session(&self, sandbox: &Sandbox, session_id: &str) -> Result<Session> {
        let session = self.repo.get_session(&sandbox.id, session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(ManagerError::Conflict(format!(
                "session {} is destroyed",
                session_id
            )));
        }
        Ok(session)
    }

    /// Run one command inside a session and wait for its buffered output.
    pub async fn session_exec(
        &self,
        org_id: &str,
        sandbox_id: &str,
        session_id: &str,
        cmd: &str,
        timeout_secs: Option<u64>,
    ) -> Result<ExecOutcome> {
        if cmd.trim().is_empty() {
            return Err(ManagerError::Validation("cmd must not be empty".to_string()));
        }
        let timeout_secs = timeout_secs
            .unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS)
            .clamp(1, MAX_EXEC_TIMEOUT_SECS);
        let sandbox = self.running(org_id, sandbox_id).await?;
        let session = self.live_session(&sandbox, session_id).await?;
        let node_id = Self::node_of(&sandbox)?;
        let replay = target(&sandbox);

        let now = self.clock.now();
        let exec = self
            .repo
            .create_exec(&Exec {
                id: generate_id(IdKind::Exec),
                sandbox_id: sandbox.id.clone(),
                org_id: sandbox.org_id.clone(),
                session_id: Some(session.id.clone()),
                seq: 0,
                cmd: vec![cmd.to_string()],
                cwd: None,
                status: ExecStatus::Running,
                exit_code: None,
                usage: None,
                duration_ms: None,
                created_at: now,
                started_at: Some(now),
                ended_at: None,
            })
            .await?;

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.nodes
                .session_exec(node_id, &sandbox.id, &session.id, cmd, timeout_secs),
        )
        .await;

        let (status, output) = match result {
            Ok(Ok(output)) => (ExecStatus::Done, Some(output)),
            Ok(Err(e)) => {
                warn!(exec_id = %exec.id, session_id = %session.id, error = %e, "Session exec failed on node");
                (ExecStatus::Failed, None)
            }
            Err(_) => (ExecStatus::TimedOut, None),
        };
        let output = output.unwrap_or_else(|| SessionExecOutput {
            exit_code: -1,
            duration_ms: started.elapsed().as_millis() as i64,
            ..SessionExecOutput::default()
        });

        for (stream, data) in [
            (OutputStream::Stdout, &output.stdout),
            (OutputStream::Stderr, &output.stderr),
        ] {
            if !data.is_empty() {
                self.notifier
                    .exec_output(&replay, &exec.id, stream, data.clone());
            }
        }

        let exit_code = (status == ExecStatus::Done).then_some(output.exit_code);
        let now = self.clock.now();
        self.repo
            .complete_exec(&exec.id, status, exit_code, None, output.duration_ms, now)
            .await?;
        self.repo.touch_activity(&sandbox.id, now).await?;
        self.notifier.record(
            &replay,
            "session.exec",
            json!({
                "session_id": session.id,
                "exec_id": exec.id,
                "cmd": cmd,
                "status": status,
                "exit_code": exit_code,
                "duration_ms": output.duration_ms,
            }),
        );

        Ok(ExecOutcome {
            exec: self.repo.get_exec(&sandbox.id, &exec.id).await?,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    pub async fn session_input(
        &self,
        org_id: &str,
        sandbox_id: &str,
        session_id: &str,
        data: &str,
    ) -> Result<()> {
        let sandbox = self.running(org_id, sandbox_id).await?;
        let session = self.live_session(&sandbox, session_id).await?;
        self.nodes
            .session_input(Self::node_of(&sandbox)?, &sandbox.id, &session.id, data)
            .await?;
        self.repo.touch_activity(&sandbox.id, self.clock.now()).await?;
        Ok(())
    }

    /// Destroy a session. Destroying it twice is a no-op.
    pub async fn destroy_session(&self, org_id: &str, sandbox_id: &str, session_id: &str) -> Result<Session> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        let session = self.repo.get_session(&sandbox.id, session_id).await?;
        if session.status == SessionStatus::Destroyed {
            return Ok(session);
        }

        if sandbox.status == SandboxStatus::Running {
            if let Some(node_id) = sandbox.node_id.as_deref() {
                if let Err(e) = self
                    .nodes
                    .destroy_session(node_id, &sandbox.id, &session.id)
                    .await
                {
                    warn!(session_id = %session.id, error = %e, "Node session teardown failed");
                }
            }
        }

        if self.repo.destroy_session(&session.id, self.clock.now()).await? {
            self.record(&sandbox, "session.destroyed", json!({ "session_id": session.id }));
        }
        Ok(self.repo.get_session(&sandbox.id, &session.id).await?)
    }

    pub async fn list_sessions(&self, org_id: &str, sandbox_id: &str) -> Result<Vec<Session>> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        Ok(self.repo.list_sessions(&sandbox.id).await?)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub async fn put_file(&self, org_id: &str, sandbox_id: &str, path: &str, content: Vec<u8>) -> Result<()> {
        validate_path(path)?;
        let sandbox = self.running(org_id, sandbox_id).await?;
        let bytes = content.len();
        self.nodes
            .put_file(Self::node_of(&sandbox)?, &sandbox.id, path, content)
            .await?;
        self.repo.touch_activity(&sandbox.id, self.clock.now()).await?;
        self.record(&sandbox, "file.written", json!({ "path": path, "bytes": bytes }));
        Ok(())
    }

    pub async fn get_file(&self, org_id: &str, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        validate_path(path)?;
        let sandbox = self.running(org_id, sandbox_id).await?;
        let content = self
            .nodes
            .get_file(Self::node_of(&sandbox)?, &sandbox.id, path)
            .await?;
        self.repo.touch_activity(&sandbox.id, self.clock.now()).await?;
        Ok(content)
    }

    pub async fn list_files(&self, org_id: &str, sandbox_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        validate_path(path)?;
        let sandbox = self.running(org_id, sandbox_id).await?;
        let entries = self
            .nodes
            .list_files(Self::node_of(&sandbox)?, &sandbox.id, path)
            .await?;
        self.repo.touch_activity(&sandbox.id, self.clock.now()).await?;
        Ok(entries)
    }

    pub async fn delete_file(&self, org_id: &str, sandbox_id: &str, path: &str) -> Result<()> {
        validate_path(path)?;
        let sandbox = self.running(org_id, sandbox_id).await?;
        self.nodes
            .delete_file(Self::node_of(&sandbox)?, &sandbox.id, path)
            .await?;
        self.repo.touch_activity(&sandbox.id, self.clock.now()).await?;
        self.record(&sandbox, "file.deleted", json!({ "path": path }));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    /// Register paths to collect at stop. Returns `(newly_registered, total)`.
    pub async fn register_artifacts(
        &self,
        org_id: &str,
        sandbox_id: &str,
        paths: Vec<String>,
        exec_id: Option<String>,
    ) -> Result<(usize, usize)> {
        if paths.is_empty() {
            return Err(ManagerError::Validation("paths must not be empty".to_string()));
        }
        for path in &paths {
            validate_path(path)?;
        }
        let sandbox = self.get(org_id, sandbox_id).await?;
        if sandbox.status.is_terminal() {
            return Err(ManagerError::SandboxNotRunning(format!(
                "{} is {}",
                sandbox.id, sandbox.status
            )));
        }

        let existing: HashSet<String> = self
            .repo
            .list_artifacts(&sandbox.id)
            .await?
            .into_iter()
            .map(|a| a.path)
            .collect();
        let mut seen = HashSet::new();
        let fresh: Vec<String> = paths
            .into_iter()
            .filter(|p| !existing.contains(p) && seen.insert(p.clone()))
            .collect();
        if existing.len() + fresh.len() > MAX_ARTIFACT_PATHS {
            return Err(ManagerError::Validation(format!(
                "at most {} artifact paths per sandbox",
                MAX_ARTIFACT_PATHS
            )));
        }
        if fresh.is_empty() {
            return Ok((0, existing.len()));
        }

        let now = self.clock.now();
        let artifacts: Vec<Artifact> = fresh
            .iter()
            .map(|path| Artifact {
                id: generate_id(IdKind::Artifact),
                sandbox_id: sandbox.id.clone(),
                org_id: sandbox.org_id.clone(),
                path: path.clone(),
                name: base_name(path),
                mime: None,
                bytes: None,
                sha256: None,
                object_ref: None,
                exec_id: exec_id.clone(),
                created_at: now,
                collected_at: None,
            })
            .collect();
        let (registered, total) = self.repo.register_artifacts(&artifacts).await?;
        self.record(
            &sandbox,
            "artifact.registered",
            json!({ "paths": fresh, "total": total }),
        );
        Ok((registered, total))
    }

    /// Registered artifacts, with a presigned download URL once collected.
    pub async fn list_artifacts(&self, org_id: &str, sandbox_id: &str) -> Result<Vec<ArtifactView>> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        let mut views = Vec::new();
        for artifact in self.repo.list_artifacts(&sandbox.id).await? {
            let download_url = match artifact.object_ref.as_deref() {
                Some(key) => Some(
                    self.objects
                        .get_presigned_url(key, ARTIFACT_URL_EXPIRY_SECS)
                        .await?,
                ),
                None => None,
            };
            views.push(ArtifactView {
                artifact,
                download_url,
            });
        }
        Ok(views)
    }

    /// Pull every uncollected artifact off the node into the object store.
    ///
    /// Files whose content does not match the node's digest are skipped.
    pub async fn collect_artifacts(&self, sandbox: &Sandbox) -> Result<usize> {
        let pending = self.repo.list_uncollected_artifacts(&sandbox.id).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let node_id = Self::node_of(sandbox)?;
        let paths: Vec<String> = pending.iter().map(|a| a.path.clone()).collect();
        let files = self
            .nodes
            .collect_artifacts(node_id, &sandbox.id, &paths)
            .await?;
        let by_path: HashMap<&str, &Artifact> =
            pending.iter().map(|a| (a.path.as_str(), a)).collect();

        let mut collected = 0;
        for file in files {
            let Some(artifact) = by_path.get(file.path.as_str()) else {
                continue;
            };
            let digest = hex::encode(Sha256::digest(&file.content));
            if !digest.eq_ignore_ascii_case(&file.sha256) {
                warn!(
                    sandbox_id = %sandbox.id,
                    path = %file.path,
                    audit = true,
                    "Artifact digest mismatch, skipping"
                );
                continue;
            }

            let key = artifact_key(&sandbox.org_id, &sandbox.id, &artifact.id, &file.name);
            let bytes = file.content.len() as i64;
            self.objects.put_object(&key, file.content, &file.mime).await?;
            self.repo
                .mark_artifact_collected(
                    &artifact.id,
                    &CollectedArtifact {
                        mime: file.mime,
                        bytes,
                        sha256: digest,
                        object_ref: key,
                    },
                    self.clock.now(),
                )
                .await?;
            collected += 1;
        }

        debug!(sandbox_id = %sandbox.id, collected, registered = pending.len(), "Artifacts collected");
        self.record(
            sandbox,
            "artifact.collected",
            json!({ "collected": collected, "registered": pending.len() }),
        );
        Ok(collected)
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    pub async fn replay(&self, org_id: &str, sandbox_id: &str, after_seq: u64) -> Result<Vec<ReplayEvent>> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        Ok(self
            .recorder
            .get_events(&sandbox.org_id, &sandbox.id, after_seq)
            .await?)
    }

    /// Replay of a sandbox its owner marked public; private ones read as missing.
    pub async fn public_replay(&self, sandbox_id: &str, after_seq: u64) -> Result<(Sandbox, Vec<ReplayEvent>)> {
        let sandbox = self.repo.get_sandbox(sandbox_id).await?;
        if !sandbox.replay_public {
            return Err(ManagerError::NotFound(sandbox_id.to_string()));
        }
        let events = self
            .recorder
            .get_events(&sandbox.org_id, &sandbox.id, after_seq)
            .await?;
        Ok((sandbox, events))
    }

    pub async fn set_replay_public(&self, org_id: &str, sandbox_id: &str, public: bool) -> Result<Sandbox> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        self.repo.set_replay_public(&sandbox.id, public).await?;
        info!(sandbox_id = %sandbox.id, replay_public = public, audit = true, "Replay visibility changed");
        Ok(self.repo.get_sandbox(&sandbox.id).await?)
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Record a node heartbeat in the node table and the coordination store.
    pub async fn node_heartbeat(&self, heartbeat: NodeHeartbeat) -> Result<Node> {
        let now = self.clock.now();
        self.repo
            .upsert_node(&Node {
                id: heartbeat.node_id.clone(),
                address: heartbeat.address,
                slots_total: heartbeat.slots_total,
                last_heartbeat_at: now,
                created_at: now,
            })
            .await?;
        self.coordination
            .register_node_heartbeat(&heartbeat.node_id, self.config.node_heartbeat_ttl_secs)
            .await?;
        debug!(
            node_id = %heartbeat.node_id,
            slots_total = heartbeat.slots_total,
            active = heartbeat.active_sandbox_ids.len(),
            "Node heartbeat"
        );
        Ok(self.repo.get_node(&heartbeat.node_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names_are_basenames() {
        assert_eq!(base_name("/output/a.txt"), "a.txt");
        assert_eq!(base_name("/output/dir/"), "dir");
    }

    #[test]
    fn paths_must_be_absolute_and_plain() {
        assert!(validate_path("/output/a.txt").is_ok());
        assert!(validate_path("output/a.txt").is_err());
        assert!(validate_path("/output/../etc/passwd").is_err());
    }

    #[test]
    fn storage_not_found_maps_to_not_found() {
        let err: ManagerError = StorageError::NotFound("sb_1".to_string()).into();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }
}
