#![warn(missing_docs)]

//! Loam replicated core: ordered KV engine, Raft consensus and replication
//! groups, typed per-entity state machines, and the DAO layer that routes
//! entity operations to the right group.

pub mod config;
pub mod consensus;
pub mod dao;
pub mod device_data;
pub mod diskstore;
pub mod entity_machine;
pub mod event_machine;
pub mod farms;
pub mod group;
pub mod host;
pub mod kvstore;
pub mod machine;
pub mod permissions;
pub mod raft_log;
pub mod snapshot;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use types::CoreError;
