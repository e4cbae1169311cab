// ABOUTME: Sandchest server library: configuration, logging and the control plane bootstrap
// ABOUTME: The `sandchest` binary parses flags and hands off to `server::run`

pub mod config;
pub mod logging;
pub mod server;


pub use config::{Config, ConfigError};
