// ABOUTME: Replay event recorder with per-sandbox sequence numbers
// ABOUTME: Dual-writes each event to the bounded live list and a buffered durable JSONL log

pub mod notifier;

pub use notifier::ReplayNotifier;

use sandchest_coordination::{CoordinationError, CoordinationStore};
use sandchest_core::constants::{REDACTED, REPLAY_FLUSH_THRESHOLD_BYTES, REPLAY_LIVE_TTL_GRACE_SECS};
use sandchest_core::{format_timestamp, Clock};
use sandchest_storage::{exec_log_key, replay_log_key, ObjectStore, ObjectStoreError, Sandbox};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::node::OutputStream;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Malformed replay event: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReplayError>;

/// One entry of a sandbox's replay log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEvent {
    pub seq: u64,
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

/// Where a sandbox's events go and how long the live copy lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayTarget {
    pub sandbox_id: String,
    pub org_id: String,
    pub live_ttl_secs: u64,
}

impl From<&Sandbox> for ReplayTarget {
    fn from(sandbox: &Sandbox) -> Self {
        Self {
            sandbox_id: sandbox.id.clone(),
            org_id: sandbox.org_id.clone(),
            live_ttl_secs: sandbox.ttl_seconds.max(0) as u64 + REPLAY_LIVE_TTL_GRACE_SECS,
        }
    }
}

/// Environment with every value replaced, so only key names reach the log.
pub fn redact_env(env: &HashMap<String, String>) -> Value {
    let redacted: BTreeMap<&str, &str> = env.keys().map(|k| (k.as_str(), REDACTED)).collect();
    json!(redacted)
}

#[derive(Debug, Default)]
struct SandboxBuffer {
    org_id: String,
    seq: u64,
    seeded: bool,
    lines: Vec<u8>,
    exec_output: BTreeMap<String, Vec<u8>>,
}

impl SandboxBuffer {
    fn pending_bytes(&self) -> usize {
        self.lines.len() + self.exec_output.values().map(Vec::len).sum::<usize>()
    }

    fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.exec_output.is_empty()
    }
}

type SharedBuffer = Arc<tokio::sync::Mutex<SandboxBuffer>>;

/// Records replay events for every sandbox this instance touches.
///
/// Each sandbox buffer has a single writer at a time, so sequence numbers
/// come out as 1, 2, 3 with no gaps under concurrent callers. The durable
/// log is appended by fetch, concatenate and overwrite; two instances
/// flushing the same sandbox at once would lose lines, which cannot happen
/// while one instance owns the sandbox's requests and terminal flush.
pub struct ReplayRecorder {
    coordination: Arc<dyn CoordinationStore>,
    objects: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    buffers: Mutex<HashMap<String, SharedBuffer>>,
}

impl ReplayRecorder {
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        objects: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            coordination,
            objects,
            clock,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn buffer(&self, target: &ReplayTarget) -> SharedBuffer {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .entry(target.sandbox_id.clone())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(SandboxBuffer {
                    org_id: target.org_id.clone(),
                    ..SandboxBuffer::default()
                }))
            })
            .clone()
    }

    fn existing_buffer(&self, sandbox_id: &str) -> Option<SharedBuffer> {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sandbox_id)
            .cloned()
    }

    /// Number of sandboxes with an in-memory buffer.
    pub fn buffered_sandboxes(&self) -> usize {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Continue numbering after whatever earlier buffers already wrote.
    async fn seed(&self, target: &ReplayTarget, buffer: &mut SandboxBuffer) -> Result<()> {
        if buffer.seeded {
            return Ok(());
        }

        let live_last = match self
            .coordination
            .get_replay_events(&target.sandbox_id, 0)
            .await
        {
            Ok(events) => events.last().map(|e| e.seq).unwrap_or(0),
            Err(e) => {
                warn!(sandbox_id = %target.sandbox_id, error = %e, "Live replay list unreadable while seeding");
                0
            }
        };
        let durable_last = self
            .durable_events(&target.org_id, &target.sandbox_id)
            .await?
            .last()
            .map(|e| e.seq)
            .unwrap_or(0);

        buffer.seq = live_last.max(durable_last);
        buffer.seeded = true;
        Ok(())
    }

    /// Append one event and return its sequence number.
    ///
    /// A failed live push only logs; the durable log stays authoritative.
    pub async fn record(&self, target: &ReplayTarget, kind: &str, data: Value) -> Result<u64> {
        let shared = self.buffer(target);
        let mut buffer = shared.lock().await;
        self.append(target, &mut buffer, kind, data).await
    }

    async fn append(
        &self,
        target: &ReplayTarget,
        buffer: &mut SandboxBuffer,
        kind: &str,
        data: Value,
    ) -> Result<u64> {
        self.seed(target, buffer).await?;

        let event = ReplayEvent {
            seq: buffer.seq + 1,
            ts: format_timestamp(&self.clock.now()),
            kind: kind.to_string(),
            data,
        };
        let line = serde_json::to_string(&event)?;
        buffer.seq = event.seq;

        if let Err(e) = self
            .coordination
            .push_replay_event(&target.sandbox_id, event.seq, &line, target.live_ttl_secs)
            .await
        {
            warn!(
                sandbox_id = %target.sandbox_id,
                seq = event.seq,
                error = %e,
                "Live replay push failed"
            );
        }

        buffer.lines.extend_from_slice(line.as_bytes());
        buffer.lines.push(b'\n');

        if buffer.pending_bytes() > REPLAY_FLUSH_THRESHOLD_BYTES {
            if let Err(e) = self.write_durable(&target.sandbox_id, buffer).await {
                warn!(sandbox_id = %target.sandbox_id, error = %e, "Threshold flush failed, keeping buffer");
            }
        }

        Ok(event.seq)
    }

    /// Keep raw output in the exec's own log and mirror it into the unified stream.
    pub async fn record_exec_output(
        &self,
        target: &ReplayTarget,
        exec_id: &str,
        stream: OutputStream,
        data: &str,
    ) -> Result<u64> {
        let shared = self.buffer(target);
        let mut buffer = shared.lock().await;
        buffer
            .exec_output
            .entry(exec_id.to_string())
            .or_default()
            .extend_from_slice(data.as_bytes());

        self.append(
            target,
            &mut buffer,
            "exec.output",
            json!({ "exec_id": exec_id, "stream": stream.as_str(), "data": data }),
        )
        .await
    }

    /// Write buffered lines to the durable log. Returns whether anything was written.
    pub async fn flush(&self, sandbox_id: &str) -> Result<bool> {
        let Some(shared) = self.existing_buffer(sandbox_id) else {
            return Ok(false);
        };
        let mut buffer = shared.lock().await;
        self.write_durable(sandbox_id, &mut buffer).await
    }

    async fn write_durable(&self, sandbox_id: &str, buffer: &mut SandboxBuffer) -> Result<bool> {
        if buffer.is_empty() {
            return Ok(false);
        }

        if !buffer.lines.is_empty() {
            let key = replay_log_key(&buffer.org_id, sandbox_id);
            self.append_object(&key, &buffer.lines, "application/x-ndjson")
                .await?;
            buffer.lines.clear();
        }

        while let Some((exec_id, output)) = buffer.exec_output.pop_first() {
            let key = exec_log_key(&buffer.org_id, sandbox_id, &exec_id);
            if let Err(e) = self.append_object(&key, &output, "text/plain").await {
                buffer.exec_output.insert(exec_id, output);
                return Err(e);
            }
        }

        debug!(sandbox_id = %sandbox_id, seq = buffer.seq, "Replay buffer flushed");
        Ok(true)
    }

    async fn append_object(&self, key: &str, tail: &[u8], content_type: &str) -> Result<()> {
        let mut body = self.objects.get_object(key).await?.unwrap_or_default();
        body.extend_from_slice(tail);
        self.objects.put_object(key, body, content_type).await?;
        Ok(())
    }

    /// Flush and drop the buffer of a sandbox that reached a terminal state.
    pub async fn release(&self, sandbox_id: &str) -> Result<()> {
        self.flush(sandbox_id).await?;
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sandbox_id);
        Ok(())
    }

    /// Flush every buffer, logging failures. Returns how many buffers were written.
    pub async fn flush_all(&self) -> usize {
        let ids: Vec<String> = self
            .buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();

        let mut flushed = 0;
        for sandbox_id in ids {
            match self.flush(&sandbox_id).await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(sandbox_id = %sandbox_id, error = %e, replay_record_failed = true, "Replay flush failed")
                }
            }
        }
        flushed
    }

    /// Events after `after_seq`, from the live list if it has any, else from the durable log.
    pub async fn get_events(
        &self,
        org_id: &str,
        sandbox_id: &str,
        after_seq: u64,
    ) -> Result<Vec<ReplayEvent>> {
        match self.coordination.get_replay_events(sandbox_id, after_seq).await {
            Ok(live) if !live.is_empty() => {
                return live
                    .iter()
                    .map(|e| serde_json::from_str(&e.event).map_err(ReplayError::from))
                    .collect();
            }
            Ok(_) => {}
            Err(e) => {
                warn!(sandbox_id = %sandbox_id, error = %e, "Live replay list unavailable, reading durable log")
            }
        }

        Ok(self
            .durable_events(org_id, sandbox_id)
            .await?
            .into_iter()
            .filter(|e| e.seq > after_seq)
            .collect())
    }

    async fn durable_events(&self, org_id: &str, sandbox_id: &str) -> Result<Vec<ReplayEvent>> {
        let Some(body) = self
            .objects
            .get_object(&replay_log_key(org_id, sandbox_id))
            .await?
        else {
            return Ok(Vec::new());
        };

        String::from_utf8_lossy(&body)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ReplayError::from))
            .collect()
    }

    /// Full output of one exec from its durable log.
    pub async fn exec_output(
        &self,
        org_id: &str,
        sandbox_id: &str,
        exec_id: &str,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .get_object(&exec_log_key(org_id, sandbox_id, exec_id))
            .await?)
    }

    /// Delete all replay data of a sandbox, live and durable.
    pub async fn purge(&self, org_id: &str, sandbox_id: &str) -> Result<usize> {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sandbox_id);

        self.objects
            .delete_object(&replay_log_key(org_id, sandbox_id))
            .await?;
        let exec_logs = self
            .objects
            .delete_prefix(&format!("{}/{}/exec/", org_id, sandbox_id))
            .await?;
        self.coordination.delete_replay_events(sandbox_id).await?;
        Ok(exec_logs + 1)
    }
}
