//! Users, roles, and pending sign-ups.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::idgen::entity_id;
use crate::ids::{FarmId, OrgId, RoleId, UserId};

/// Name of the distinguished administrative role.
pub const ADMIN_ROLE: &str = "admin";

/// An account. Identity is the email address: the id is derived from it, so
/// two users can never share an email.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    /// Identifier derived from the email address.
    pub id: UserId,
    /// Login email, unique by construction.
    pub email: String,
    /// Argon2 hash of the password. Never the cleartext.
    pub password_hash: String,
    /// Roles granted directly to this user.
    pub roles: Vec<Role>,
    /// Organizations this user belongs to. Maintained through permission
    /// operations.
    pub organization_refs: BTreeSet<OrgId>,
    /// Farms this user is a member of. Maintained through farm saves and
    /// permission operations.
    pub farm_refs: BTreeSet<FarmId>,
}

impl User {
    /// Builds a user with the id derived from the email.
    pub fn with_email(email: &str) -> Self {
        User {
            id: Self::id_for_email(email),
            email: email.to_string(),
            ..User::default()
        }
    }

    /// Identifier a user with this email must carry.
    pub fn id_for_email(email: &str) -> UserId {
        UserId::new(entity_id(email))
    }

    /// True if the user carries a role with the given name.
    pub fn has_role(&self, name: &str) -> bool {
        self.roles.iter().any(|r| r.name == name)
    }
}

/// A named capability grant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Role {
    /// Identifier derived from the role name.
    pub id: RoleId,
    /// Role name.
    pub name: String,
}

impl Role {
    /// Builds a role with the id derived from the name.
    pub fn named(name: &str) -> Self {
        Role {
            id: RoleId::new(entity_id(name)),
            name: name.to_string(),
        }
    }

    /// The distinguished administrative role.
    pub fn admin() -> Self {
        Self::named(ADMIN_ROLE)
    }
}

/// A pending sign-up awaiting completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registration {
    /// Identifier derived from the email address.
    pub id: u64,
    /// Email the sign-up was requested for.
    pub email: String,
    /// Wall-clock nanoseconds when the sign-up was recorded.
    pub created_at: u64,
}

impl Registration {
    /// Builds a registration with the id derived from the email.
    pub fn with_email(email: &str) -> Self {
        Registration {
            id: entity_id(email),
            email: email.to_string(),
            created_at: 0,
        }
    }
}
