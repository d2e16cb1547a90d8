#![warn(missing_docs)]

//! Loam live layer: in-memory farm state with telemetry diffing, TTL caches
//! over recent device and farm snapshots, and per-farm subscription hubs
//! that fan events out to connected clients.

pub mod cache;
pub mod engine;
pub mod error;
pub mod hub;
pub mod state;

pub use engine::{LiveConfig, LiveEngine};
pub use error::LiveError;
pub use state::FarmState;
