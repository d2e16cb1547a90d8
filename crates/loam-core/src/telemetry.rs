//! Telemetry stores: per-farm event logs, per-device state history, and the
//! replicated farm-state checkpoints.
//!
//! Unlike the entity families, these groups are not started when the DAO
//! opens. Every farm and device gets a replication group of its own, derived
//! from its id, started the first time the store touches it. Reads ensure
//! the group too, so a fresh process asking for history it never wrote gets
//! an empty answer instead of an unknown-group error.

use std::sync::Arc;

use loam_model::codec;
use loam_model::events::EventLogEntry;
use loam_model::idgen::{device_data_group, event_log_group, farm_state_group};
use loam_model::ids::{DeviceId, FarmId};
use loam_model::state::{DeviceStateMap, FarmStateMap};
use loam_model::ConsistencyLevel;

use crate::dao::{EntityPage, GroupTopology};
use crate::device_data::{metric_series, DeviceDataMachine};
use crate::entity_machine::FarmStateMachine;
use crate::event_machine::EventLogMachine;
use crate::host::GroupHost;
use crate::kvstore::Kv;
use crate::machine::{PageQuery, Proposal, Query, QueryOutput, StateMachine};
use crate::types::{CoreError, GroupId, SortOrder};

// Starting a group that already runs reports a config error. When two
// callers race the first touch, the loser treats that as success.
fn ensure_group<F>(
    host: &Arc<GroupHost>,
    topology: &GroupTopology,
    group_id: GroupId,
    factory: F,
) -> Result<(), CoreError>
where
    F: FnOnce(Arc<dyn Kv>) -> Arc<dyn StateMachine>,
{
    if host.has_group(group_id) {
        return Ok(());
    }
    match host.start_group(topology.params(group_id), factory) {
        Ok(()) => Ok(()),
        Err(CoreError::Config(_)) if host.has_group(group_id) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Append-only event history, one replication group per farm.
#[derive(Clone)]
pub struct EventLogStore {
    host: Arc<GroupHost>,
    topology: GroupTopology,
}

impl EventLogStore {
    pub(crate) fn new(host: Arc<GroupHost>, topology: GroupTopology) -> Self {
        EventLogStore { host, topology }
    }

    fn ensure(&self, farm_id: FarmId) -> Result<GroupId, CoreError> {
        let group_id = GroupId::new(event_log_group(farm_id));
        ensure_group(&self.host, &self.topology, group_id, |kv| {
            Arc::new(EventLogMachine::new(kv)) as Arc<dyn StateMachine>
        })?;
        Ok(group_id)
    }

    /// Appends an event to its farm's log. The stored id is assigned at
    /// apply time from the event timestamp; a zero id on the way in is
    /// normal.
    pub async fn append(&self, event: &EventLogEntry) -> Result<(), CoreError> {
        let group_id = self.ensure(event.farm_id)?;
        let proposal = Proposal::update(codec::to_bytes(event)?);
        self.host.propose(group_id, proposal.encode()?).await?;
        Ok(())
    }

    /// Newest-first page of a farm's events.
    pub async fn page(
        &self,
        farm_id: FarmId,
        page: u64,
        page_size: u64,
        level: ConsistencyLevel,
    ) -> Result<EntityPage<EventLogEntry>, CoreError> {
        self.get_page(
            farm_id,
            PageQuery {
                page,
                page_size,
                sort_order: SortOrder::Desc,
            },
            level,
        )
        .await
    }

    /// One page of a farm's events in the requested order.
    pub async fn get_page(
        &self,
        farm_id: FarmId,
        page: PageQuery,
        level: ConsistencyLevel,
    ) -> Result<EntityPage<EventLogEntry>, CoreError> {
        let group_id = self.ensure(farm_id)?;
        match self.host.read(group_id, Query::Page(page), level).await? {
            QueryOutput::Page(result) => {
                let items: Result<Vec<EventLogEntry>, CoreError> = result
                    .items
                    .iter()
                    .map(|bytes| Ok(codec::from_bytes(bytes)?))
                    .collect();
                Ok(EntityPage {
                    items: items?,
                    has_more: result.has_more,
                })
            }
            _ => Err(CoreError::UnsupportedQuery(Query::Page(page))),
        }
    }

    /// Every retained event of a farm, oldest first.
    pub async fn get_all(
        &self,
        farm_id: FarmId,
        level: ConsistencyLevel,
    ) -> Result<Vec<EventLogEntry>, CoreError> {
        let group_id = self.ensure(farm_id)?;
        match self.host.read(group_id, Query::Wildcard, level).await? {
            QueryOutput::Values(values) => values
                .iter()
                .map(|bytes| Ok(codec::from_bytes(bytes)?))
                .collect(),
            _ => Err(CoreError::UnsupportedQuery(Query::Wildcard)),
        }
    }
}

/// Reported device state history, one replication group per device.
#[derive(Clone)]
pub struct DeviceDataStore {
    host: Arc<GroupHost>,
    topology: GroupTopology,
}

impl DeviceDataStore {
    pub(crate) fn new(host: Arc<GroupHost>, topology: GroupTopology) -> Self {
        DeviceDataStore { host, topology }
    }

    fn ensure(&self, device_id: DeviceId) -> Result<GroupId, CoreError> {
        let group_id = GroupId::new(device_data_group(device_id));
        ensure_group(&self.host, &self.topology, group_id, |kv| {
            Arc::new(DeviceDataMachine::new(kv)) as Arc<dyn StateMachine>
        })?;
        Ok(group_id)
    }

    /// Appends one reported state to the device's history.
    pub async fn save(&self, state: &DeviceStateMap) -> Result<(), CoreError> {
        let group_id = self.ensure(state.device_id)?;
        let proposal = Proposal::update(codec::to_bytes(state)?);
        self.host.propose(group_id, proposal.encode()?).await?;
        Ok(())
    }

    /// Retained history of a device, oldest first.
    pub async fn history(
        &self,
        device_id: DeviceId,
        level: ConsistencyLevel,
    ) -> Result<Vec<DeviceStateMap>, CoreError> {
        let group_id = self.ensure(device_id)?;
        match self.host.read(group_id, Query::Wildcard, level).await? {
            QueryOutput::Values(values) => values
                .iter()
                .map(|bytes| Ok(codec::from_bytes(bytes)?))
                .collect(),
            _ => Err(CoreError::UnsupportedQuery(Query::Wildcard)),
        }
    }

    /// Values of one metric across the retained window, oldest first.
    /// A record missing the key makes the whole read fail with
    /// [`CoreError::MetricKeyNotFound`]; silent gaps would skew any
    /// computation done over the series.
    pub async fn last_30_days(
        &self,
        device_id: DeviceId,
        metric_key: &str,
        level: ConsistencyLevel,
    ) -> Result<Vec<f64>, CoreError> {
        let records = self.history(device_id, level).await?;
        metric_series(&records, metric_key)
    }
}

/// Replicated farm-state checkpoints, one single-record group per farm. The
/// live engine rebuilds its in-memory state from here after a restart.
#[derive(Clone)]
pub struct FarmStateStore {
    host: Arc<GroupHost>,
    topology: GroupTopology,
}

impl FarmStateStore {
    pub(crate) fn new(host: Arc<GroupHost>, topology: GroupTopology) -> Self {
        FarmStateStore { host, topology }
    }

    fn ensure(&self, farm_id: FarmId) -> Result<GroupId, CoreError> {
        let group_id = GroupId::new(farm_state_group(farm_id));
        ensure_group(&self.host, &self.topology, group_id, |kv| {
            Arc::new(FarmStateMachine::new(kv)) as Arc<dyn StateMachine>
        })?;
        Ok(group_id)
    }

    /// Replaces the checkpoint for a farm.
    pub async fn save(&self, state: &FarmStateMap) -> Result<(), CoreError> {
        let group_id = self.ensure(state.farm_id)?;
        let proposal = Proposal::update(codec::to_bytes(state)?);
        self.host.propose(group_id, proposal.encode()?).await?;
        Ok(())
    }

    /// Checkpoint for a farm, or [`CoreError::NotFound`] before the first
    /// save.
    pub async fn get(
        &self,
        farm_id: FarmId,
        level: ConsistencyLevel,
    ) -> Result<FarmStateMap, CoreError> {
        self.try_get(farm_id, level)
            .await?
            .ok_or(CoreError::NotFound)
    }

    /// Checkpoint for a farm, or `None` before the first save.
    pub async fn try_get(
        &self,
        farm_id: FarmId,
        level: ConsistencyLevel,
    ) -> Result<Option<FarmStateMap>, CoreError> {
        let group_id = self.ensure(farm_id)?;
        let query = Query::Point(farm_id.as_u64());
        match self.host.read(group_id, query, level).await? {
            QueryOutput::Value(Some(bytes)) => Ok(Some(codec::from_bytes(&bytes)?)),
            QueryOutput::Value(None) => Ok(None),
            _ => Err(CoreError::UnsupportedQuery(Query::Point(farm_id.as_u64()))),
        }
    }
}
