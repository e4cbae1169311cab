// ABOUTME: The coordination store contract shared by every control-plane instance
// ABOUTME: Atomic set-if-absent with TTL, compare-and-set renewal, counters and list append

use async_trait::async_trait;

use crate::rate_limit::RateLimitDecision;
use crate::Result;

/// Upper bound on events kept in a sandbox's live replay list.
pub const LIVE_REPLAY_MAX_EVENTS: usize = 10_000;

/// One entry of a sandbox's live replay list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveReplayEvent {
    pub seq: u64,
    /// Serialized event line.
    pub event: String,
}

pub(crate) fn slot_key(node_id: &str, slot: u32) -> String {
    format!("node:{}:slot:{}", node_id, slot)
}

pub(crate) fn leader_key(duty: &str) -> String {
    format!("leader:{}", duty)
}

pub(crate) fn heartbeat_key(node_id: &str) -> String {
    format!("node:{}:heartbeat", node_id)
}

pub(crate) fn rate_key(org_id: &str, category: &str, window_start_ms: i64) -> String {
    format!("ratelimit:{}:{}:{}", org_id, category, window_start_ms)
}

/// Low-latency shared state used for admission control and live replay.
///
/// Lease and lock values expire on their own; an unrenewed holder simply
/// loses the key. Implementations read time from an injected clock.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomic set-if-absent on `(node_id, slot)`. `false` means another sandbox holds it.
    async fn acquire_slot_lease(
        &self,
        node_id: &str,
        slot: u32,
        sandbox_id: &str,
        ttl_secs: u64,
    ) -> Result<bool>;

    /// Extend the lease only while it is still held by `sandbox_id`.
    async fn renew_slot_lease(
        &self,
        node_id: &str,
        slot: u32,
        sandbox_id: &str,
        ttl_secs: u64,
    ) -> Result<bool>;

    /// Unconditional delete.
    async fn release_slot_lease(&self, node_id: &str, slot: u32) -> Result<()>;

    async fn get_slot_holder(&self, node_id: &str, slot: u32) -> Result<Option<String>>;

    /// Increment the `(org, category)` counter of the current fixed window and check it.
    async fn check_rate_limit(
        &self,
        org_id: &str,
        category: &str,
        limit: u32,
        window_secs: u64,
    ) -> Result<RateLimitDecision>;

    /// Append to the sandbox's bounded live list and refresh its TTL.
    async fn push_replay_event(
        &self,
        sandbox_id: &str,
        seq: u64,
        event: &str,
        ttl_secs: u64,
    ) -> Result<()>;

    /// Live events with `seq > after_seq`, in sequence order.
    async fn get_replay_events(&self, sandbox_id: &str, after_seq: u64)
        -> Result<Vec<LiveReplayEvent>>;

    async fn delete_replay_events(&self, sandbox_id: &str) -> Result<()>;

    /// Acquire or, for the current holder, renew the lock on `duty`.
    async fn acquire_leader_lock(&self, duty: &str, instance_id: &str, ttl_secs: u64)
        -> Result<bool>;

    async fn register_node_heartbeat(&self, node_id: &str, ttl_secs: u64) -> Result<()>;

    async fn has_node_heartbeat(&self, node_id: &str) -> Result<bool>;

    /// Drop expired keys, counters and lists. Returns how many entries were removed.
    async fn purge_expired(&self) -> Result<usize>;
}
