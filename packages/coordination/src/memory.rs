// ABOUTME: Single-process coordination store for tests and one-instance deployments
// ABOUTME: Mirrors the atomic semantics of the shared backends under one mutex

use async_trait::async_trait;
use sandchest_core::Clock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::rate_limit::{fixed_window, RateLimitDecision};
use crate::store::{
    heartbeat_key, leader_key, rate_key, slot_key, CoordinationStore, LiveReplayEvent,
    LIVE_REPLAY_MAX_EVENTS,
};
use crate::{CoordinationError, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct ReplayList {
    events: BTreeMap<u64, String>,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct State {
    keys: HashMap<String, Entry>,
    counters: HashMap<String, (u64, i64)>,
    replay: HashMap<String, ReplayList>,
}

impl State {
    fn live_value(&self, key: &str, now_ms: i64) -> Option<&str> {
        self.keys
            .get(key)
            .filter(|e| e.expires_at_ms > now_ms)
            .map(|e| e.value.as_str())
    }
}

pub struct MemoryCoordinationStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryCoordinationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinationError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| CoordinationError::Unavailable("state lock poisoned".to_string()))
    }

    fn deadline(&self, ttl_secs: u64) -> i64 {
        self.clock.now_ms() + (ttl_secs as i64) * 1000
    }

    /// Set `key` if it is absent, expired, or already held by `value`.
    fn set_if_free(&self, key: String, value: &str, ttl_secs: u64, reentrant: bool) -> Result<bool> {
        let now = self.clock.now_ms();
        let expires_at_ms = self.deadline(ttl_secs);
        let mut state = self.lock()?;

        let free = match state.live_value(&key, now) {
            None => true,
            Some(holder) => reentrant && holder == value,
        };
        if free {
            state.keys.insert(
                key,
                Entry {
                    value: value.to_string(),
                    expires_at_ms,
                },
            );
        }
        Ok(free)
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn acquire_slot_lease(
        &self,
        node_id: &str,
        slot: u32,
        sandbox_id: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        self.set_if_free(slot_key(node_id, slot), sandbox_id, ttl_secs, false)
    }

    async fn renew_slot_lease(
        &self,
        node_id: &str,
        slot: u32,
        sandbox_id: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        let now = self.clock.now_ms();
        let expires_at_ms = self.deadline(ttl_secs);
        let key = slot_key(node_id, slot);
        let mut state = self.lock()?;

        if state.live_value(&key, now) != Some(sandbox_id) {
            return Ok(false);
        }
        if let Some(entry) = state.keys.get_mut(&key) {
            entry.expires_at_ms = expires_at_ms;
        }
        Ok(true)
    }

    async fn release_slot_lease(&self, node_id: &str, slot: u32) -> Result<()> {
        self.lock()?.keys.remove(&slot_key(node_id, slot));
        Ok(())
    }

    async fn get_slot_holder(&self, node_id: &str, slot: u32) -> Result<Option<String>> {
        let now = self.clock.now_ms();
        let state = self.lock()?;
        Ok(state
            .live_value(&slot_key(node_id, slot), now)
            .map(str::to_string))
    }

    async fn check_rate_limit(
        &self,
        org_id: &str,
        category: &str,
        limit: u32,
        window_secs: u64,
    ) -> Result<RateLimitDecision> {
        let (start, reset_at_ms) = fixed_window(self.clock.now_ms(), window_secs);
        let mut state = self.lock()?;

        let counter = state
            .counters
            .entry(rate_key(org_id, category, start))
            .or_insert((0, reset_at_ms));
        counter.0 += 1;

        Ok(RateLimitDecision::from_count(counter.0, limit, reset_at_ms))
    }

    async fn push_replay_event(
        &self,
        sandbox_id: &str,
        seq: u64,
        event: &str,
        ttl_secs: u64,
    ) -> Result<()> {
        let expires_at_ms = self.deadline(ttl_secs);
        let mut state = self.lock()?;

        let list = state.replay.entry(sandbox_id.to_string()).or_default();
        list.events.insert(seq, event.to_string());
        while list.events.len() > LIVE_REPLAY_MAX_EVENTS {
            list.events.pop_first();
        }
        list.expires_at_ms = expires_at_ms;
        Ok(())
    }

    async fn get_replay_events(
        &self,
        sandbox_id: &str,
        after_seq: u64,
    ) -> Result<Vec<LiveReplayEvent>> {
        let now = self.clock.now_ms();
        let state = self.lock()?;

        let Some(list) = state.replay.get(sandbox_id).filter(|l| l.expires_at_ms > now) else {
            return Ok(Vec::new());
        };

        Ok(list
            .events
            .range(after_seq.saturating_add(1)..)
            .map(|(seq, event)| LiveReplayEvent {
                seq: *seq,
                event: event.clone(),
            })
            .collect())
    }

    async fn delete_replay_events(&self, sandbox_id: &str) -> Result<()> {
        self.lock()?.replay.remove(sandbox_id);
        Ok(())
    }

    async fn acquire_leader_lock(
        &self,
        duty: &str,
        instance_id: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        self.set_if_free(leader_key(duty), instance_id, ttl_secs, true)
    }

    async fn register_node_heartbeat(&self, node_id: &str, ttl_secs: u64) -> Result<()> {
        let expires_at_ms = self.deadline(ttl_secs);
        self.lock()?.keys.insert(
            heartbeat_key(node_id),
            Entry {
                value: "1".to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn has_node_heartbeat(&self, node_id: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        Ok(self.lock()?.live_value(&heartbeat_key(node_id), now).is_some())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut state = self.lock()?;
        let before = state.keys.len() + state.counters.len() + state.replay.len();

        state.keys.retain(|_, e| e.expires_at_ms > now);
        state.counters.retain(|_, (_, expires)| *expires > now);
        state.replay.retain(|_, l| l.expires_at_ms > now);

        Ok(before - (state.keys.len() + state.counters.len() + state.replay.len()))
    }
}
