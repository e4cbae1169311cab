// ABOUTME: Leader-gated background sweeps over sandboxes, leases and replay retention
// ABOUTME: Each duty re-reads its full candidate set every cycle and skips items that fail

use chrono::Duration as ChronoDuration;
use sandchest_coordination::{CoordinationStore, LeaderElection};
use sandchest_core::constants::{
    DEFAULT_TRANSITION_TIMEOUT_SECS, FAILURE_IDLE_TIMEOUT, FAILURE_LEASE_LOST, FAILURE_NODE_LOST,
    FAILURE_QUEUE_TIMEOUT, FAILURE_TRANSITION_TIMEOUT, FAILURE_TTL_EXPIRED,
    TTL_WARNING_WINDOW_SECS,
};
use sandchest_core::{format_timestamp, Clock};
use sandchest_storage::SandboxRepository;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::manager::{Result, SandboxManager};

pub const DUTY_SCHEDULER: &str = "scheduler";
pub const DUTY_LEASES: &str = "leases";
pub const DUTY_TTL: &str = "ttl";
pub const DUTY_TTL_WARNING: &str = "ttl_warning";
pub const DUTY_IDLE: &str = "idle";
pub const DUTY_QUEUE: &str = "queue";
pub const DUTY_NODES: &str = "nodes";
pub const DUTY_STUCK: &str = "stuck";
pub const DUTY_REPLAY_EXPIRY: &str = "replay_expiry";
pub const DUTY_REPLAY_PURGE: &str = "replay_purge";

pub const DUTIES: [&str; 10] = [
    DUTY_SCHEDULER,
    DUTY_LEASES,
    DUTY_TTL,
    DUTY_TTL_WARNING,
    DUTY_IDLE,
    DUTY_QUEUE,
    DUTY_NODES,
    DUTY_STUCK,
    DUTY_REPLAY_EXPIRY,
    DUTY_REPLAY_PURGE,
];

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval_secs: u64,
    pub idle_timeout_secs: i64,
    pub replay_retention_days: i64,
    /// Deadline for leaving `provisioning` or `stopping`.
    pub transition_timeout_secs: i64,
    /// Rows fetched per sweep by the batched duties.
    pub batch_limit: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            idle_timeout_secs: 900,
            replay_retention_days: 30,
            transition_timeout_secs: DEFAULT_TRANSITION_TIMEOUT_SECS,
            batch_limit: 100,
        }
    }
}

/// Items acted on per duty in one sweep. Duties this instance did not lead are absent.
pub type SweepReport = HashMap<&'static str, usize>;

pub struct Reaper {
    manager: SandboxManager,
    election: LeaderElection,
    config: ReaperConfig,
    shutdown: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Reaper {
    pub fn new(manager: SandboxManager, election: LeaderElection, config: ReaperConfig) -> Self {
        Self {
            manager,
            election,
            config,
            shutdown: Mutex::new(None),
        }
    }

    /// Start sweeping every `interval_secs`. Starting twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.shutdown.lock().await;
        if running.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let reaper = self.clone();
        let handle = tokio::spawn(async move {
            info!(
                instance_id = %reaper.election.instance_id(),
                interval_secs = reaper.config.interval_secs,
                "Reaper started"
            );
            let mut ticker = time::interval(Duration::from_secs(reaper.config.interval_secs.max(1)));
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = reaper.sweep_once().await;
                        debug!(?report, "Reaper sweep finished");
                    }
                    _ = rx.changed() => break,
                }
            }
            info!("Reaper stopped");
        });
        *running = Some((tx, handle));
    }

    /// Stop the loop and wait for an in-progress sweep to finish.
    pub async fn stop(&self) {
        let Some((tx, handle)) = self.shutdown.lock().await.take() else {
            return;
        };
        let _ = tx.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "Reaper task ended abnormally");
        }
    }

    /// Run every duty this instance currently leads.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::new();
        for duty in DUTIES {
            if !self.election.is_leader(duty).await {
                continue;
            }
            match self.run_duty(duty).await {
                Ok(count) => {
                    report.insert(duty, count);
                }
                Err(e) => warn!(duty = %duty, error = %e, "Reaper duty failed"),
            }
        }
        report
    }

    pub async fn run_duty(&self, duty: &str) -> Result<usize> {
        match duty {
            DUTY_SCHEDULER => self.schedule_queued().await,
            DUTY_LEASES => self.renew_leases().await,
            DUTY_TTL => self.stop_expired().await,
            DUTY_TTL_WARNING => self.warn_near_expiry().await,
            DUTY_IDLE => self.stop_idle().await,
            DUTY_QUEUE => self.fail_queue_timeouts().await,
            DUTY_NODES => self.fail_lost_nodes().await,
            DUTY_STUCK => self.fail_stuck_transitions().await,
            DUTY_REPLAY_EXPIRY => self.set_replay_expiry().await,
            DUTY_REPLAY_PURGE => self.purge_replays().await,
            _ => Ok(0),
        }
    }

    async fn schedule_queued(&self) -> Result<usize> {
        let mut placed = 0;
        for sandbox in self.manager.repo().list_queued(self.config.batch_limit).await? {
            match self.manager.schedule(&sandbox).await {
                Ok(updated) if updated.status != sandbox.status => placed += 1,
                Ok(_) => {}
                Err(e) => warn!(sandbox_id = %sandbox.id, error = %e, "Scheduling retry failed"),
            }
        }
        Ok(placed)
    }

    /// Renew the lease of every sandbox occupying a slot.
    ///
    /// A sandbox whose lapsed slot was claimed by another sandbox is failed,
    /// so two VMs never share a slot past one sweep.
    async fn renew_leases(&self) -> Result<usize> {
        let leases = self.manager.leases();
        let mut renewed = 0;
        for sandbox in self.manager.repo().list_on_nodes().await? {
            let (Some(node_id), Some(slot)) = (sandbox.node_id.as_deref(), sandbox.slot) else {
                continue;
            };
            match leases.renew_or_reacquire(node_id, slot, &sandbox.id).await {
                Ok(true) => renewed += 1,
                Ok(false) => {
                    warn!(
                        sandbox_id = %sandbox.id,
                        node_id = %node_id,
                        slot,
                        "Slot lease lost to another sandbox"
                    );
                    if let Err(e) = self.manager.fail(&sandbox, FAILURE_LEASE_LOST).await {
                        warn!(sandbox_id = %sandbox.id, error = %e, "Lease-lost failure not applied");
                    }
                }
                Err(e) => warn!(sandbox_id = %sandbox.id, error = %e, "Lease renewal failed"),
            }
        }

        match self.manager.coordination().purge_expired().await {
            Ok(purged) if purged > 0 => debug!(purged, "Expired coordination keys purged"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Coordination purge failed"),
        }
        Ok(renewed)
    }

    async fn stop_expired(&self) -> Result<usize> {
        let now = self.manager.clock().now();
        let mut stopped = 0;
        for sandbox in self.manager.repo().find_expired_ttl(now).await? {
            match self
                .manager
                .stop_sandbox(&sandbox, Some(FAILURE_TTL_EXPIRED))
                .await
            {
                Ok(_) => stopped += 1,
                Err(e) => warn!(sandbox_id = %sandbox.id, error = %e, "TTL stop failed"),
            }
        }
        Ok(stopped)
    }

    async fn warn_near_expiry(&self) -> Result<usize> {
        let now = self.manager.clock().now();
        let mut warned = 0;
        for sandbox in self
            .manager
            .repo()
            .find_near_ttl_expiry(now, TTL_WARNING_WINDOW_SECS)
            .await?
        {
            if let Err(e) = self.manager.repo().mark_ttl_warned(&sandbox.id, now).await {
                warn!(sandbox_id = %sandbox.id, error = %e, "TTL warning not marked");
                continue;
            }
            let expires_at = sandbox.expires_at.as_ref().map(format_timestamp);
            self.manager
                .record(&sandbox, "sandbox.ttl_warning", json!({ "expires_at": expires_at }));
            warned += 1;
        }
        Ok(warned)
    }

    async fn stop_idle(&self) -> Result<usize> {
        let cutoff =
            self.manager.clock().now() - ChronoDuration::seconds(self.config.idle_timeout_secs);
        let mut stopped = 0;
        for sandbox in self.manager.repo().find_idle_since(cutoff).await? {
            match self
                .manager
                .stop_sandbox(&sandbox, Some(FAILURE_IDLE_TIMEOUT))
                .await
            {
                Ok(_) => stopped += 1,
                Err(e) => warn!(sandbox_id = %sandbox.id, error = %e, "Idle stop failed"),
            }
        }
        Ok(stopped)
    }

    async fn fail_queue_timeouts(&self) -> Result<usize> {
        let now = self.manager.clock().now();
        let mut failed = 0;
        for sandbox in self.manager.repo().find_queued_before(now).await? {
            match self.manager.fail(&sandbox, FAILURE_QUEUE_TIMEOUT).await {
                Ok(true) => failed += 1,
                Ok(false) => {}
                Err(e) => warn!(sandbox_id = %sandbox.id, error = %e, "Queue timeout failed"),
            }
        }
        Ok(failed)
    }

    async fn fail_lost_nodes(&self) -> Result<usize> {
        let mut alive: HashMap<String, bool> = HashMap::new();
        let mut failed = 0;
        for sandbox in self.manager.repo().list_on_nodes().await? {
            let Some(node_id) = sandbox.node_id.clone() else {
                continue;
            };
            let live = match alive.get(&node_id) {
                Some(live) => *live,
                None => {
                    // A store error must not read as a dead node.
                    let live = self.manager.coordination().has_node_heartbeat(&node_id).await?;
                    alive.insert(node_id.clone(), live);
                    live
                }
            };
            if live {
                continue;
            }
            match self.manager.fail(&sandbox, FAILURE_NODE_LOST).await {
                Ok(true) => failed += 1,
                Ok(false) => {}
                Err(e) => warn!(sandbox_id = %sandbox.id, error = %e, "Node-lost failure not applied"),
            }
        }
        Ok(failed)
    }

    /// Fail sandboxes left in `provisioning` or `stopping`, e.g. by a crashed instance.
    async fn fail_stuck_transitions(&self) -> Result<usize> {
        let cutoff = self.manager.clock().now()
            - ChronoDuration::seconds(self.config.transition_timeout_secs);
        let mut failed = 0;
        for sandbox in self.manager.repo().find_stuck_transitions(cutoff).await? {
            match self.manager.fail(&sandbox, FAILURE_TRANSITION_TIMEOUT).await {
                Ok(true) => {
                    info!(
                        sandbox_id = %sandbox.id,
                        status = %sandbox.status,
                        "Sandbox stuck mid-transition failed"
                    );
                    failed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(sandbox_id = %sandbox.id, error = %e, "Stuck transition not failed"),
            }
        }
        Ok(failed)
    }

    async fn set_replay_expiry(&self) -> Result<usize> {
        let retention = ChronoDuration::days(self.config.replay_retention_days);
        let mut updated = 0;
        for sandbox in self
            .manager
            .repo()
            .find_missing_replay_expiry(self.config.batch_limit)
            .await?
        {
            let ended_at = sandbox.ended_at.unwrap_or_else(|| self.manager.clock().now());
            match self
                .manager
                .repo()
                .set_replay_expiry(&sandbox.id, ended_at + retention)
                .await
            {
                Ok(()) => updated += 1,
                Err(e) => warn!(sandbox_id = %sandbox.id, error = %e, "Replay expiry not set"),
            }
        }
        Ok(updated)
    }

    async fn purge_replays(&self) -> Result<usize> {
        let now = self.manager.clock().now();
        let mut purged = 0;
        for sandbox in self
            .manager
            .repo()
            .find_purgable_replays(now, self.config.batch_limit)
            .await?
        {
            if let Err(e) = self.manager.recorder().purge(&sandbox.org_id, &sandbox.id).await {
                warn!(sandbox_id = %sandbox.id, error = %e, "Replay purge failed");
                continue;
            }
            match self.manager.repo().mark_replay_purged(&sandbox.id, now).await {
                Ok(()) => {
                    info!(sandbox_id = %sandbox.id, "Replay data purged");
                    purged += 1;
                }
                Err(e) => warn!(sandbox_id = %sandbox.id, error = %e, "Replay purge not marked"),
            }
        }
        Ok(purged)
    }
}
