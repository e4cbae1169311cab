// ABOUTME: Core identifiers, constants and time utilities for Sandchest
// ABOUTME: Foundational package shared by storage, coordination, sandbox and api crates

pub mod clock;
pub mod constants;
pub mod id;
pub mod utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use id::{generate_id, parse_id, IdError, IdKind};
pub use utils::{format_timestamp, parse_timestamp};
