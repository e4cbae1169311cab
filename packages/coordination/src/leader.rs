// ABOUTME: Leader election over named duties for singleton background work
// ABOUTME: Each duty is an independent TTL lock re-acquired by its holder every cycle

use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::CoordinationStore;

/// Elects one instance per duty.
///
/// Leadership lapses silently when the holder stops renewing. Two instances
/// may both believe they lead for up to one TTL after a stall, so duties
/// must tolerate a sweep running twice.
#[derive(Clone)]
pub struct LeaderElection {
    store: Arc<dyn CoordinationStore>,
    instance_id: String,
    ttl_secs: u64,
}

impl LeaderElection {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        instance_id: impl Into<String>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            ttl_secs,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Acquire or renew leadership of `duty`. Store errors count as not leading.
    pub async fn is_leader(&self, duty: &str) -> bool {
        match self
            .store
            .acquire_leader_lock(duty, &self.instance_id, self.ttl_secs)
            .await
        {
            Ok(leader) => {
                debug!(duty = %duty, instance_id = %self.instance_id, leader, "Leader check");
                leader
            }
            Err(e) => {
                warn!(duty = %duty, error = %e, "Leader lock check failed, skipping duty");
                false
            }
        }
    }
}
