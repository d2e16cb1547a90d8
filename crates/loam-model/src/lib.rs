#![warn(missing_docs)]

//! Loam entity model: farms, devices, users, organizations, live-state maps,
//! deterministic 64-bit identifier derivation, and the JSON codec shared by
//! every on-disk state machine.

pub mod algorithm;
pub mod clock;
pub mod codec;
pub mod error;
pub mod events;
pub mod farm;
pub mod idgen;
pub mod ids;
pub mod org;
pub mod server;
pub mod state;
pub mod user;

pub use error::ModelError;
pub use farm::ConsistencyLevel;
