//! Organizations: tenant-level grouping of farms and users.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::farm::Farm;
use crate::ids::{OrgId, UserId};

/// A tenant grouping farms and members. Farms nested here are shared with the
/// organization's users; membership edges are kept as id sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Organization {
    /// Identifier derived from the organization name.
    pub id: OrgId,
    /// Display name, unique per deployment.
    pub name: String,
    /// Farms grouped under this organization. Each must carry an assigned id
    /// before the organization is persisted.
    pub farms: Vec<Farm>,
    /// Member users, by id. Maintained through permission operations.
    pub user_refs: BTreeSet<UserId>,
}

impl Organization {
    /// True if the user is a member of this organization.
    pub fn has_user(&self, user_id: UserId) -> bool {
        self.user_refs.contains(&user_id)
    }

    /// True when every nested farm carries a non-zero id.
    pub fn farms_keyed(&self) -> bool {
        self.farms.iter().all(|f| !f.id.is_zero())
    }
}
