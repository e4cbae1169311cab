// ABOUTME: Capacity lease manager binding (node, slot) pairs to sandboxes
// ABOUTME: The sole admission gate against running more VMs on a node than it has slots

use std::sync::Arc;
use tracing::debug;

use crate::store::CoordinationStore;
use crate::Result;

/// Hands out TTL-bounded slot leases.
///
/// Store errors propagate: a failed acquire must never be read as "free".
/// An unrenewed lease expires on its own, which is how slots held by a
/// crashed instance return to the pool. Until it does, the slot cannot be
/// reassigned, so a crash costs at most one TTL of idle capacity.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn CoordinationStore>,
    ttl_secs: u64,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub async fn acquire(&self, node_id: &str, slot: u32, sandbox_id: &str) -> Result<bool> {
        let acquired = self
            .store
            .acquire_slot_lease(node_id, slot, sandbox_id, self.ttl_secs)
            .await?;
        debug!(node_id = %node_id, slot, sandbox_id = %sandbox_id, acquired, "Slot lease acquire");
        Ok(acquired)
    }

    /// Acquire the first free slot in `0..slots_total`.
    pub async fn acquire_any(
        &self,
        node_id: &str,
        slots_total: u32,
        sandbox_id: &str,
    ) -> Result<Option<u32>> {
        for slot in 0..slots_total {
            if self.acquire(node_id, slot, sandbox_id).await? {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    pub async fn renew(&self, node_id: &str, slot: u32, sandbox_id: &str) -> Result<bool> {
        self.store
            .renew_slot_lease(node_id, slot, sandbox_id, self.ttl_secs)
            .await
    }

    /// Renew, or take the slot back if the lease lapsed and nobody else claimed it.
    ///
    /// Returns false when another sandbox now holds the slot.
    pub async fn renew_or_reacquire(
        &self,
        node_id: &str,
        slot: u32,
        sandbox_id: &str,
    ) -> Result<bool> {
        if self.renew(node_id, slot, sandbox_id).await? {
            return Ok(true);
        }
        self.acquire(node_id, slot, sandbox_id).await
    }

    pub async fn release(&self, node_id: &str, slot: u32) -> Result<()> {
        self.store.release_slot_lease(node_id, slot).await?;
        debug!(node_id = %node_id, slot, "Slot lease released");
        Ok(())
    }

    /// Release the slot unless another sandbox has claimed it since.
    ///
    /// Returns false when the slot belongs to someone else and was left alone.
    pub async fn release_held(&self, node_id: &str, slot: u32, sandbox_id: &str) -> Result<bool> {
        match self.holder(node_id, slot).await? {
            Some(holder) if holder != sandbox_id => {
                debug!(
                    node_id = %node_id,
                    slot,
                    sandbox_id = %sandbox_id,
                    holder = %holder,
                    "Slot lease belongs to another sandbox, not releasing"
                );
                Ok(false)
            }
            _ => {
                self.release(node_id, slot).await?;
                Ok(true)
            }
        }
    }

    pub async fn holder(&self, node_id: &str, slot: u32) -> Result<Option<String>> {
        self.store.get_slot_holder(node_id, slot).await
    }
}
