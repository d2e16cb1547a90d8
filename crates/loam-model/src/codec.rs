//! JSON codec used for every entity payload stored in a state machine.
//!
//! Entities travel through replication and land on disk as JSON documents.
//! Decoding tolerates missing fields (they take their defaults) and ignores
//! unknown ones, so nodes running different schema revisions can read each
//! other's payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ModelError;

/// Encodes an entity as a JSON byte payload.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ModelError> {
    Ok(serde_json::to_vec(value)?)
}

/// Decodes an entity from a JSON byte payload.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ModelError> {
    Ok(serde_json::from_slice(bytes)?)
}
