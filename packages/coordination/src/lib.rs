// ABOUTME: Cross-instance coordination for the Sandchest control plane
// ABOUTME: TTL-bounded leases and locks, fixed-window counters and bounded live replay lists

pub mod leader;
pub mod lease;
pub mod memory;
pub mod rate_limit;
pub mod sql;
pub mod store;

pub use leader::LeaderElection;
pub use lease::LeaseManager;
pub use memory::MemoryCoordinationStore;
pub use rate_limit::{fixed_window, RateLimitDecision};
pub use sql::SqlCoordinationStore;
pub use store::{CoordinationStore, LiveReplayEvent};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Coordination database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
