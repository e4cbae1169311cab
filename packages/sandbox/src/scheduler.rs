// ABOUTME: Places queued sandboxes onto live nodes through slot leases
// ABOUTME: A node is eligible only when both its row and its coordination heartbeat are fresh

use chrono::Duration;
use sandchest_coordination::{CoordinationStore, LeaseManager};
use sandchest_core::Clock;
use sandchest_storage::{Node, NodeRepository, Repository};
use std::sync::Arc;
use tracing::debug;

use crate::manager::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node_id: String,
    pub slot: u32,
}

#[derive(Clone)]
pub struct Scheduler {
    repo: Arc<dyn Repository>,
    coordination: Arc<dyn CoordinationStore>,
    leases: LeaseManager,
    clock: Arc<dyn Clock>,
    heartbeat_ttl_secs: u64,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn Repository>,
        coordination: Arc<dyn CoordinationStore>,
        leases: LeaseManager,
        clock: Arc<dyn Clock>,
        heartbeat_ttl_secs: u64,
    ) -> Self {
        Self {
            repo,
            coordination,
            leases,
            clock,
            heartbeat_ttl_secs,
        }
    }

    /// Nodes with a recent heartbeat row and a live heartbeat key.
    pub async fn active_nodes(&self) -> Result<Vec<Node>> {
        let since = self.clock.now() - Duration::seconds(self.heartbeat_ttl_secs as i64);
        let mut active = Vec::new();
        for node in self.repo.get_active_nodes(since).await? {
            if self.coordination.has_node_heartbeat(&node.id).await? {
                active.push(node);
            }
        }
        Ok(active)
    }

    /// Lease the first free slot on any active node.
    ///
    /// `None` means no capacity right now. Store errors propagate so a
    /// failed lease check is never taken as a free slot.
    pub async fn place(&self, sandbox_id: &str) -> Result<Option<Placement>> {
        for node in self.active_nodes().await? {
            if let Some(slot) = self
                .leases
                .acquire_any(&node.id, node.slots_total, sandbox_id)
                .await?
            {
                debug!(sandbox_id = %sandbox_id, node_id = %node.id, slot, "Sandbox placed");
                return Ok(Some(Placement {
                    node_id: node.id,
                    slot,
                }));
            }
        }
        debug!(sandbox_id = %sandbox_id, "No free slot on any active node");
        Ok(None)
    }
}
