//! Membership maintenance. A permission names a user together with the
//! organization and farm it may act on; saving one rewrites the reference
//! sets on all three entities so the authorization layer can resolve
//! membership from any side of the edge.

use serde::{Deserialize, Serialize};
use tracing::info;

use loam_model::farm::Farm;
use loam_model::ids::{FarmId, OrgId, RoleId, UserId};
use loam_model::org::Organization;
use loam_model::user::User;
use loam_model::ConsistencyLevel;

use crate::dao::EntityStore;
use crate::types::CoreError;

/// A membership edge. Permissions are not persisted as entities of their
/// own; the edge lives in the reference sets of the entities it names.
/// A zero `org_id` or `farm_id` leaves that side untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permission {
    /// Organization the user becomes a member of. Zero skips the org leg.
    pub org_id: OrgId,
    /// Farm the user becomes a member of. Zero skips the farm leg.
    pub farm_id: FarmId,
    /// The user being granted membership. Must name an existing user.
    pub user_id: UserId,
    /// Role attached to the grant, carried for the authorization layer.
    pub role_id: RoleId,
}

/// Applies permission edges across the user, organization, and farm stores.
#[derive(Clone)]
pub struct PermissionStore {
    users: EntityStore<User>,
    orgs: EntityStore<Organization>,
    farms: EntityStore<Farm>,
}

impl PermissionStore {
    pub(crate) fn new(
        users: EntityStore<User>,
        orgs: EntityStore<Organization>,
        farms: EntityStore<Farm>,
    ) -> Self {
        PermissionStore { users, orgs, farms }
    }

    /// Grants membership: the user's ref sets gain the org and farm ids, and
    /// the org and farm membership lists gain the user. Every entity that
    /// changed is re-proposed. The user must exist; the org and farm legs
    /// require their entities too.
    pub async fn save(&self, permission: &Permission) -> Result<(), CoreError> {
        let mut user = self
            .users
            .get(permission.user_id.as_u64(), ConsistencyLevel::Quorum)
            .await?;
        let mut user_dirty = false;

        if !permission.org_id.is_zero() {
            if user.organization_refs.insert(permission.org_id) {
                user_dirty = true;
            }
            let mut org = self
                .orgs
                .get(permission.org_id.as_u64(), ConsistencyLevel::Quorum)
                .await?;
            if org.user_refs.insert(user.id) {
                self.orgs.save(&org).await?;
            }
        }

        if !permission.farm_id.is_zero() {
            if user.farm_refs.insert(permission.farm_id) {
                user_dirty = true;
            }
            let mut farm = self
                .farms
                .get(permission.farm_id.as_u64(), ConsistencyLevel::Quorum)
                .await?;
            if !farm.has_user(user.id) {
                farm.users.push(user.id);
                // The raw entity write is deliberate: the farm cascade's
                // member maintenance is the very edge being written here.
                self.farms.save(&farm).await?;
            }
        }

        if user_dirty {
            self.users.save(&user).await?;
        }
        info!(user_id = %permission.user_id, org_id = %permission.org_id,
            farm_id = %permission.farm_id, role_id = %permission.role_id, "permission saved");
        Ok(())
    }

    /// Revokes membership: the mirror of [`save`](Self::save). The org or
    /// farm may have been deleted already; their legs are then skipped, which
    /// is how dangling refs left by a farm delete get repaired.
    pub async fn delete(&self, permission: &Permission) -> Result<(), CoreError> {
        let mut user = self
            .users
            .get(permission.user_id.as_u64(), ConsistencyLevel::Quorum)
            .await?;
        let mut user_dirty = false;

        if !permission.org_id.is_zero() {
            if user.organization_refs.remove(&permission.org_id) {
                user_dirty = true;
            }
            if let Some(mut org) = self
                .orgs
                .try_get(permission.org_id.as_u64(), ConsistencyLevel::Quorum)
                .await?
            {
                if org.user_refs.remove(&user.id) {
                    self.orgs.save(&org).await?;
                }
            }
        }

        if !permission.farm_id.is_zero() {
            if user.farm_refs.remove(&permission.farm_id) {
                user_dirty = true;
            }
            if let Some(mut farm) = self
                .farms
                .try_get(permission.farm_id.as_u64(), ConsistencyLevel::Quorum)
                .await?
            {
                let members = farm.users.len();
                farm.users.retain(|member| *member != user.id);
                if farm.users.len() != members {
                    self.farms.save(&farm).await?;
                }
            }
        }

        if user_dirty {
            self.users.save(&user).await?;
        }
        info!(user_id = %permission.user_id, org_id = %permission.org_id,
            farm_id = %permission.farm_id, "permission deleted");
        Ok(())
    }
}
