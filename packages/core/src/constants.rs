//! Limits and defaults shared across the control plane.

/// Replay bytes buffered per sandbox before a durable flush is forced.
pub const REPLAY_FLUSH_THRESHOLD_BYTES: usize = 64 * 1024;

/// Extra retention granted to the live replay list beyond the sandbox TTL.
pub const REPLAY_LIVE_TTL_GRACE_SECS: u64 = 10 * 60;

/// Fixed window used by the per-tenant request budgets.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Placeholder written in place of environment variable values in replay events.
pub const REDACTED: &str = "[REDACTED]";

/// Upper bound on registered artifact paths per sandbox.
pub const MAX_ARTIFACT_PATHS: usize = 100;

/// Lifetime of presigned artifact download URLs.
pub const ARTIFACT_URL_EXPIRY_SECS: u64 = 3600;

/// Window before TTL expiry in which a sandbox receives a warning event.
pub const TTL_WARNING_WINDOW_SECS: i64 = 5 * 60;

pub const DEFAULT_TTL_SECS: i64 = 3600;
pub const DEFAULT_QUEUE_TIMEOUT_SECS: i64 = 300;
pub const MAX_TTL_SECS: i64 = 7 * 24 * 3600;

pub const DEFAULT_IMAGE: &str = "ubuntu-22.04";
pub const DEFAULT_PROFILE: &str = "small";
pub const PROFILES: &[&str] = &["small", "medium", "large"];

/// Failure reason written when a sandbox is deleted before reaching a terminal state.
pub const FAILURE_SANDBOX_DELETED: &str = "sandbox_deleted";
pub const FAILURE_TTL_EXPIRED: &str = "ttl_expired";
pub const FAILURE_IDLE_TIMEOUT: &str = "idle_timeout";
pub const FAILURE_QUEUE_TIMEOUT: &str = "queue_timeout";
pub const FAILURE_NODE_LOST: &str = "node_lost";
pub const FAILURE_PROVISION_FAILED: &str = "provision_failed";
/// The slot lease lapsed and another sandbox claimed the slot.
pub const FAILURE_LEASE_LOST: &str = "lease_lost";
/// Stuck in `provisioning` or `stopping` past the transition deadline.
pub const FAILURE_TRANSITION_TIMEOUT: &str = "transition_timeout";

/// How long a sandbox may sit in `provisioning` or `stopping` before the reaper fails it.
pub const DEFAULT_TRANSITION_TIMEOUT_SECS: i64 = 5 * 60;

/// Command deadline applied when a request does not set one.
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 300;
pub const MAX_EXEC_TIMEOUT_SECS: u64 = 3600;

pub const DEFAULT_SHELL: &str = "/bin/bash";
