//! Errors produced by the entity model layer.

use thiserror::Error;

/// Errors raised while encoding or decoding model entities.
#[derive(Debug, Error)]
pub enum ModelError {
    /// JSON encoding or decoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
