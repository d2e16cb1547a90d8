//! Control-recipe documents.

use serde::{Deserialize, Serialize};

use crate::idgen::entity_id;

/// An opaque control recipe targeting one device kind. The body is
/// interpreted by the actuation layer; the core only persists it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Algorithm {
    /// Identifier derived from the algorithm name.
    pub id: u64,
    /// Recipe name, unique per deployment.
    pub name: String,
    /// Device kind this recipe applies to.
    pub device_type: String,
    /// Recipe document, uninterpreted by the core.
    pub body: String,
}

impl Algorithm {
    /// Builds a recipe with the id derived from its name.
    pub fn named(name: &str) -> Self {
        Algorithm {
            id: entity_id(name),
            name: name.to_string(),
            ..Algorithm::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_assigns_id() {
        let a = Algorithm::named("ph balance");
        assert_eq!(a.id, entity_id("ph balance"));
        assert_eq!(a.name, "ph balance");
    }
}
