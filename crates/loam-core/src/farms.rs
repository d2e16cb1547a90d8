//! Farm persistence: identifier assignment, the save and delete cascades,
//! and traversals over the nested configuration tree.
//!
//! A farm save is more than one proposal. The farm itself is replicated
//! first; the server's farm index and each member user's farm refs are then
//! brought in line with it. Failures after the farm write are logged and
//! returned so the caller can retry the maintenance; there is no rollback.

use std::sync::Arc;

use tracing::{info, warn};

use loam_model::farm::{Channel, Condition, Device, Farm, Metric, Schedule, Workflow};
use loam_model::idgen::assign_farm_ids;
use loam_model::ids::{ChannelId, DeviceId, FarmId, UserId};
use loam_model::user::User;
use loam_model::ConsistencyLevel;

use crate::dao::{
    entity_group, EntityPage, EntityStore, GroupTopology, ServerStore, FARMS_GROUP, USERS_GROUP,
};
use crate::host::GroupHost;
use crate::machine::PageQuery;
use crate::types::CoreError;

/// Store for farms and their nested configuration entities.
#[derive(Clone)]
pub struct FarmStore {
    farms: EntityStore<Farm>,
    users: EntityStore<User>,
    servers: ServerStore,
}

impl FarmStore {
    pub(crate) fn new(host: Arc<GroupHost>) -> Self {
        FarmStore {
            farms: EntityStore::new(Arc::clone(&host), entity_group(FARMS_GROUP)),
            users: EntityStore::new(Arc::clone(&host), entity_group(USERS_GROUP)),
            servers: ServerStore::new(host),
        }
    }

    pub(crate) fn start_group(&self, topology: &GroupTopology) -> Result<(), CoreError> {
        self.farms.start_group(topology)
    }

    pub(crate) fn entity_store(&self) -> EntityStore<Farm> {
        self.farms.clone()
    }

    /// Farm by identifier, or [`CoreError::NotFound`].
    pub async fn get(&self, id: FarmId, level: ConsistencyLevel) -> Result<Farm, CoreError> {
        self.farms.get(id.as_u64(), level).await
    }

    /// Farm by identifier, or `None` when absent.
    pub async fn try_get(
        &self,
        id: FarmId,
        level: ConsistencyLevel,
    ) -> Result<Option<Farm>, CoreError> {
        self.farms.try_get(id.as_u64(), level).await
    }

    /// Every farm, in identifier order.
    pub async fn get_all(&self, level: ConsistencyLevel) -> Result<Vec<Farm>, CoreError> {
        self.farms.get_all(level).await
    }

    /// One page of farms.
    pub async fn get_page(
        &self,
        page: PageQuery,
        level: ConsistencyLevel,
    ) -> Result<EntityPage<Farm>, CoreError> {
        self.farms.get_page(page, level).await
    }

    /// Persists a farm and brings the dependent references in line.
    ///
    /// Before the write, every zero id in the tree is assigned and devices
    /// without an interval inherit the farm's. After it, the farm id is
    /// added to the server's farm index and to each member user's farm refs.
    pub async fn save(&self, farm: &mut Farm) -> Result<(), CoreError> {
        if farm.name.is_empty() {
            return Err(CoreError::Config("farm name is required".to_string()));
        }
        assign_farm_ids(farm);
        farm.inherit_intervals();
        self.farms.save(farm).await?;

        // The farm is durable from here on. Maintenance failures are logged
        // and returned; the caller retries by saving again.
        let mut server = match self.servers.get(ConsistencyLevel::Quorum).await {
            Ok(server) => server,
            Err(e) => {
                warn!(farm_id = %farm.id, error = %e, "farm saved but server read failed");
                return Err(e);
            }
        };
        if server.farm_refs.insert(farm.id) {
            if let Err(e) = self.servers.save(&mut server).await {
                warn!(farm_id = %farm.id, error = %e, "farm saved but server index update failed");
                return Err(e);
            }
        }

        for user_id in &farm.users {
            let mut user = match self.users.try_get(user_id.as_u64(), ConsistencyLevel::Quorum).await
            {
                Ok(Some(user)) => user,
                Ok(None) => {
                    // Membership is repaired when the user is created through
                    // a permission save.
                    warn!(farm_id = %farm.id, user_id = %user_id, "farm member does not exist yet");
                    continue;
                }
                Err(e) => {
                    warn!(farm_id = %farm.id, user_id = %user_id, error = %e,
                        "farm saved but member read failed");
                    return Err(e);
                }
            };
            if user.farm_refs.insert(farm.id) {
                if let Err(e) = self.users.save(&user).await {
                    warn!(farm_id = %farm.id, user_id = %user_id, error = %e,
                        "farm saved but member refs update failed");
                    return Err(e);
                }
            }
        }
        info!(farm_id = %farm.id, name = %farm.name, "farm saved");
        Ok(())
    }

    /// Removes a farm and drops it from the server's farm index. Member
    /// users keep their farm refs; permission deletion clears those.
    pub async fn delete(&self, farm: &Farm) -> Result<(), CoreError> {
        self.farms.delete(farm.id.as_u64()).await?;

        let mut server = match self.servers.get(ConsistencyLevel::Quorum).await {
            Ok(server) => server,
            Err(e) => {
                warn!(farm_id = %farm.id, error = %e, "farm deleted but server read failed");
                return Err(e);
            }
        };
        if server.farm_refs.remove(&farm.id) {
            if let Err(e) = self.servers.save(&mut server).await {
                warn!(farm_id = %farm.id, error = %e, "farm deleted but server index update failed");
                return Err(e);
            }
        }
        info!(farm_id = %farm.id, name = %farm.name, "farm deleted");
        Ok(())
    }

    /// Farms the user is a member of, resolved through the user's farm refs.
    /// Refs to since-deleted farms are skipped.
    pub async fn farms_by_user(
        &self,
        user_id: UserId,
        level: ConsistencyLevel,
    ) -> Result<Vec<Farm>, CoreError> {
        let user = self.users.get(user_id.as_u64(), level).await?;
        let mut farms = Vec::with_capacity(user.farm_refs.len());
        for farm_id in &user.farm_refs {
            if let Some(farm) = self.farms.try_get(farm_id.as_u64(), level).await? {
                farms.push(farm);
            }
        }
        Ok(farms)
    }

    /// Devices owned by a farm.
    pub async fn devices_by_farm(
        &self,
        farm_id: FarmId,
        level: ConsistencyLevel,
    ) -> Result<Vec<Device>, CoreError> {
        Ok(self.get(farm_id, level).await?.devices)
    }

    /// Device by identifier, located by scanning farms.
    pub async fn device_by_id(
        &self,
        device_id: DeviceId,
        level: ConsistencyLevel,
    ) -> Result<Device, CoreError> {
        for farm in self.get_all(level).await? {
            if let Some(device) = farm.devices.into_iter().find(|d| d.id == device_id) {
                return Ok(device);
            }
        }
        Err(CoreError::NotFound)
    }

    /// Channel by identifier, located by scanning farms.
    pub async fn channel_by_id(
        &self,
        channel_id: ChannelId,
        level: ConsistencyLevel,
    ) -> Result<Channel, CoreError> {
        for farm in self.get_all(level).await? {
            for device in farm.devices {
                if let Some(channel) = device.channels.into_iter().find(|c| c.id == channel_id) {
                    return Ok(channel);
                }
            }
        }
        Err(CoreError::NotFound)
    }

    /// Metrics reported by a device.
    pub async fn metrics_by_device(
        &self,
        device_id: DeviceId,
        level: ConsistencyLevel,
    ) -> Result<Vec<Metric>, CoreError> {
        Ok(self.device_by_id(device_id, level).await?.metrics)
    }

    /// Conditions attached to a channel.
    pub async fn conditions_by_channel(
        &self,
        channel_id: ChannelId,
        level: ConsistencyLevel,
    ) -> Result<Vec<Condition>, CoreError> {
        Ok(self.channel_by_id(channel_id, level).await?.conditions)
    }

    /// Schedules attached to a channel.
    pub async fn schedules_by_channel(
        &self,
        channel_id: ChannelId,
        level: ConsistencyLevel,
    ) -> Result<Vec<Schedule>, CoreError> {
        Ok(self.channel_by_id(channel_id, level).await?.schedules)
    }

    /// Workflows owned by a farm, each with its steps in `sort_order`.
    pub async fn workflows_by_farm(
        &self,
        farm_id: FarmId,
        level: ConsistencyLevel,
    ) -> Result<Vec<Workflow>, CoreError> {
        let farm = self.get(farm_id, level).await?;
        let mut workflows = farm.workflows;
        for workflow in &mut workflows {
            workflow.sort_steps();
        }
        Ok(workflows)
    }

    /// Inserts or replaces a metric on a device, then saves the owning farm.
    pub async fn save_metric(
        &self,
        device_id: DeviceId,
        metric: &Metric,
    ) -> Result<(), CoreError> {
        let mut farm = self.farm_with_device(device_id).await?;
        {
            let device = farm
                .devices
                .iter_mut()
                .find(|d| d.id == device_id)
                .ok_or(CoreError::NotFound)?;
            // Identity within a device is the key; the id derives from it.
            let slot = device.metrics.iter_mut().find(|m| {
                if metric.id.is_zero() {
                    m.key == metric.key
                } else {
                    m.id == metric.id
                }
            });
            match slot {
                Some(existing) => *existing = metric.clone(),
                None => device.metrics.push(metric.clone()),
            }
        }
        self.save(&mut farm).await
    }

    /// Inserts or replaces a condition on a channel, then saves the owning
    /// farm.
    pub async fn save_condition(
        &self,
        channel_id: ChannelId,
        condition: &Condition,
    ) -> Result<(), CoreError> {
        let mut farm = self.farm_with_channel(channel_id).await?;
        {
            let channel = channel_mut(&mut farm, channel_id)?;
            let slot = channel
                .conditions
                .iter_mut()
                .find(|c| condition.id != 0 && c.id == condition.id);
            match slot {
                Some(existing) => *existing = condition.clone(),
                None => channel.conditions.push(condition.clone()),
            }
        }
        self.save(&mut farm).await
    }

    /// Inserts or replaces a schedule on a channel, then saves the owning
    /// farm.
    pub async fn save_schedule(
        &self,
        channel_id: ChannelId,
        schedule: &Schedule,
    ) -> Result<(), CoreError> {
        let mut farm = self.farm_with_channel(channel_id).await?;
        {
            let channel = channel_mut(&mut farm, channel_id)?;
            let slot = channel
                .schedules
                .iter_mut()
                .find(|s| schedule.id != 0 && s.id == schedule.id);
            match slot {
                Some(existing) => *existing = schedule.clone(),
                None => channel.schedules.push(schedule.clone()),
            }
        }
        self.save(&mut farm).await
    }

    // Read-modify-write starts from a linearizable read so the mutation
    // lands on the newest tree.
    async fn farm_with_device(&self, device_id: DeviceId) -> Result<Farm, CoreError> {
        for farm in self.get_all(ConsistencyLevel::Quorum).await? {
            if farm.devices.iter().any(|d| d.id == device_id) {
                return Ok(farm);
            }
        }
        Err(CoreError::NotFound)
    }

    async fn farm_with_channel(&self, channel_id: ChannelId) -> Result<Farm, CoreError> {
        for farm in self.get_all(ConsistencyLevel::Quorum).await? {
            let has_channel = farm
                .devices
                .iter()
                .flat_map(|d| &d.channels)
                .any(|c| c.id == channel_id);
            if has_channel {
                return Ok(farm);
            }
        }
        Err(CoreError::NotFound)
    }
}

fn channel_mut(farm: &mut Farm, channel_id: ChannelId) -> Result<&mut Channel, CoreError> {
    farm.devices
        .iter_mut()
        .flat_map(|d| d.channels.iter_mut())
        .find(|c| c.id == channel_id)
        .ok_or(CoreError::NotFound)
}
