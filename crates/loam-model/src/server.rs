//! The server record: a singleton index of top-level entities.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::idgen::entity_id;
use crate::ids::{FarmId, OrgId};

/// Stable key the singleton server record's id is derived from.
pub const SERVER_KEY: &str = "server";

/// Cluster-wide singleton carrying reference indexes to every saved farm and
/// organization. Refs are indexes, never owners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    /// Identifier derived from [`SERVER_KEY`]; identical on every node.
    pub id: u64,
    /// Every saved farm appears here exactly once.
    pub farm_refs: BTreeSet<FarmId>,
    /// Every saved organization appears here exactly once.
    pub organization_refs: BTreeSet<OrgId>,
}

impl Server {
    /// Identifier of the singleton record.
    pub fn singleton_id() -> u64 {
        entity_id(SERVER_KEY)
    }

    /// A fresh server record with the singleton id assigned.
    pub fn singleton() -> Self {
        Server {
            id: Self::singleton_id(),
            ..Server::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton_id_stable() {
        assert_eq!(Server::singleton_id(), Server::singleton_id());
        assert_eq!(Server::singleton().id, Server::singleton_id());
        assert_ne!(Server::singleton_id(), 0);
    }

    #[test]
    fn test_refs_deduplicate() {
        let mut s = Server::singleton();
        let f = FarmId::new(3);
        assert!(s.farm_refs.insert(f));
        assert!(!s.farm_refs.insert(f));
        assert_eq!(s.farm_refs.len(), 1);
    }
}
