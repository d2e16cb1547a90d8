//! Data access layer: typed entity stores over the replication host.
//!
//! Each record family lives in its own replication group with a
//! deterministic identifier derived from the family label, so every node
//! routes the same entity to the same group without coordination. Writes are
//! proposals through the group leader; reads take a [`ConsistencyLevel`] and
//! either stay on the local replica or go through the leader's read path.
//!
//! [`EntityStore`] carries the mechanics shared by every family. The typed
//! stores wrap it with identity assignment and the cross-entity maintenance
//! rules; the heavier cascades live in the `farms` and `permissions` modules.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use loam_model::algorithm::Algorithm;
use loam_model::clock::unix_nanos;
use loam_model::codec;
use loam_model::idgen::entity_id;
use loam_model::org::Organization;
use loam_model::server::Server;
use loam_model::user::{Registration, User};
use loam_model::ConsistencyLevel;

use crate::entity_machine::{EntityMachine, Keyed};
use crate::farms::FarmStore;
use crate::host::{GroupHost, GroupParams};
use crate::machine::{PageQuery, Proposal, Query, QueryOutput, StateMachine};
use crate::permissions::PermissionStore;
use crate::telemetry::{DeviceDataStore, EventLogStore, FarmStateStore};
use crate::types::{CoreError, GroupId, NodeId};

/// Group label for the server singleton.
pub const SERVER_GROUP: &str = "server";
/// Group label for organizations.
pub const ORGS_GROUP: &str = "organizations";
/// Group label for users.
pub const USERS_GROUP: &str = "users";
/// Group label for farms.
pub const FARMS_GROUP: &str = "farms";
/// Group label for pending sign-ups.
pub const REGISTRATIONS_GROUP: &str = "registrations";
/// Group label for control recipes.
pub const ALGORITHMS_GROUP: &str = "algorithms";

/// Replication-group id for an entity-family label.
pub fn entity_group(label: &str) -> GroupId {
    GroupId::new(entity_id(label))
}

/// Membership shared by every group the DAO starts.
#[derive(Debug, Clone, Default)]
pub struct GroupTopology {
    /// The other members of each group. Empty for a single-node deployment.
    pub peers: Vec<NodeId>,
    /// True when this node joins existing clusters instead of bootstrapping.
    pub join: bool,
}

impl GroupTopology {
    pub(crate) fn params(&self, group_id: GroupId) -> GroupParams {
        GroupParams {
            group_id,
            peers: self.peers.clone(),
            join: self.join,
        }
    }
}

/// One page of decoded records.
#[derive(Debug, Clone)]
pub struct EntityPage<T> {
    /// Records in the requested order.
    pub items: Vec<T>,
    /// True when at least one record exists past this page.
    pub has_more: bool,
}

/// Generic store for one record family in one replication group.
pub struct EntityStore<T> {
    host: Arc<GroupHost>,
    group_id: GroupId,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        EntityStore {
            host: Arc::clone(&self.host),
            group_id: self.group_id,
            _entity: PhantomData,
        }
    }
}

impl<T> EntityStore<T>
where
    T: Keyed + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Builds a store routing to the given group.
    pub fn new(host: Arc<GroupHost>, group_id: GroupId) -> Self {
        EntityStore {
            host,
            group_id,
            _entity: PhantomData,
        }
    }

    /// Group this store routes to.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub(crate) fn start_group(&self, topology: &GroupTopology) -> Result<(), CoreError> {
        self.host.start_group(topology.params(self.group_id), |kv| {
            Arc::new(EntityMachine::<T>::new(kv)) as Arc<dyn StateMachine>
        })
    }

    /// Record by identifier, or `None` when absent.
    pub async fn try_get(
        &self,
        id: u64,
        level: ConsistencyLevel,
    ) -> Result<Option<T>, CoreError> {
        match self.host.read(self.group_id, Query::Point(id), level).await? {
            QueryOutput::Value(Some(bytes)) => Ok(Some(codec::from_bytes(&bytes)?)),
            QueryOutput::Value(None) => Ok(None),
            _ => Err(CoreError::UnsupportedQuery(Query::Point(id))),
        }
    }

    /// Record by identifier, or [`CoreError::NotFound`].
    pub async fn get(&self, id: u64, level: ConsistencyLevel) -> Result<T, CoreError> {
        self.try_get(id, level).await?.ok_or(CoreError::NotFound)
    }

    /// Replicates the record and waits for the applied ack.
    pub async fn save(&self, record: &T) -> Result<(), CoreError> {
        let data = codec::to_bytes(record)?;
        self.host
            .propose(self.group_id, Proposal::update(data).encode()?)
            .await?;
        Ok(())
    }

    /// Removes the record with the given identifier.
    pub async fn delete(&self, id: u64) -> Result<(), CoreError> {
        self.host
            .propose(self.group_id, Proposal::delete(id).encode()?)
            .await?;
        Ok(())
    }

    /// Every record, in identifier order.
    pub async fn get_all(&self, level: ConsistencyLevel) -> Result<Vec<T>, CoreError> {
        match self.host.read(self.group_id, Query::Wildcard, level).await? {
            QueryOutput::Values(values) => values
                .iter()
                .map(|bytes| Ok(codec::from_bytes(bytes)?))
                .collect(),
            _ => Err(CoreError::UnsupportedQuery(Query::Wildcard)),
        }
    }

    /// One page of records.
    pub async fn get_page(
        &self,
        page: PageQuery,
        level: ConsistencyLevel,
    ) -> Result<EntityPage<T>, CoreError> {
        match self.host.read(self.group_id, Query::Page(page), level).await? {
            QueryOutput::Page(result) => Ok(EntityPage {
                items: result
                    .items
                    .iter()
                    .map(|bytes| Ok(codec::from_bytes(bytes)?))
                    .collect::<Result<Vec<T>, CoreError>>()?,
                has_more: result.has_more,
            }),
            _ => Err(CoreError::UnsupportedQuery(Query::Page(page))),
        }
    }
}

/// Store for the per-deployment server singleton.
#[derive(Clone)]
pub struct ServerStore {
    inner: EntityStore<Server>,
}

impl ServerStore {
    pub(crate) fn new(host: Arc<GroupHost>) -> Self {
        ServerStore {
            inner: EntityStore::new(host, entity_group(SERVER_GROUP)),
        }
    }

    pub(crate) fn start_group(&self, topology: &GroupTopology) -> Result<(), CoreError> {
        self.inner.start_group(topology)
    }

    /// The server record. Fresh deployments see the empty singleton, so
    /// callers can always read-modify-write without an existence check.
    pub async fn get(&self, level: ConsistencyLevel) -> Result<Server, CoreError> {
        Ok(self
            .inner
            .try_get(Server::singleton_id(), level)
            .await?
            .unwrap_or_else(Server::singleton))
    }

    /// Persists the server record under the singleton identity.
    pub async fn save(&self, server: &mut Server) -> Result<(), CoreError> {
        if server.id == 0 {
            server.id = Server::singleton_id();
        }
        self.inner.save(server).await
    }
}

/// Store for user accounts. Identity is the email address.
#[derive(Clone)]
pub struct UserStore {
    inner: EntityStore<User>,
}

impl UserStore {
    pub(crate) fn new(host: Arc<GroupHost>) -> Self {
        UserStore {
            inner: EntityStore::new(host, entity_group(USERS_GROUP)),
        }
    }

    pub(crate) fn start_group(&self, topology: &GroupTopology) -> Result<(), CoreError> {
        self.inner.start_group(topology)
    }

    pub(crate) fn entity_store(&self) -> EntityStore<User> {
        self.inner.clone()
    }

    /// User by identifier, or [`CoreError::NotFound`].
    pub async fn get(&self, id: u64, level: ConsistencyLevel) -> Result<User, CoreError> {
        self.inner.get(id, level).await
    }

    /// User by identifier, or `None` when absent.
    pub async fn try_get(
        &self,
        id: u64,
        level: ConsistencyLevel,
    ) -> Result<Option<User>, CoreError> {
        self.inner.try_get(id, level).await
    }

    /// User by email, resolved through the deterministic identity.
    pub async fn get_by_email(
        &self,
        email: &str,
        level: ConsistencyLevel,
    ) -> Result<User, CoreError> {
        self.inner
            .get(User::id_for_email(email).as_u64(), level)
            .await
    }

    /// Persists the user, deriving the id from the email when unset. A user
    /// whose id does not match its email is rejected before anything is
    /// written.
    pub async fn save(&self, user: &mut User) -> Result<(), CoreError> {
        if user.email.is_empty() {
            return Err(CoreError::Config("user email is required".to_string()));
        }
        let expected = User::id_for_email(&user.email);
        if user.id.is_zero() {
            user.id = expected;
        } else if user.id != expected {
            return Err(CoreError::Config(format!(
                "user id {} does not match email {:?}",
                user.id, user.email
            )));
        }
        self.inner.save(user).await
    }

    /// Removes a user record. Reference cleanup is the permission layer's
    /// concern.
    pub async fn delete(&self, id: u64) -> Result<(), CoreError> {
        self.inner.delete(id).await
    }

    /// Every user, in identifier order.
    pub async fn get_all(&self, level: ConsistencyLevel) -> Result<Vec<User>, CoreError> {
        self.inner.get_all(level).await
    }

    /// One page of users.
    pub async fn get_page(
        &self,
        page: PageQuery,
        level: ConsistencyLevel,
    ) -> Result<EntityPage<User>, CoreError> {
        self.inner.get_page(page, level).await
    }
}

/// Store for organizations.
#[derive(Clone)]
pub struct OrgStore {
    inner: EntityStore<Organization>,
}

impl OrgStore {
    pub(crate) fn new(host: Arc<GroupHost>) -> Self {
        OrgStore {
            inner: EntityStore::new(host, entity_group(ORGS_GROUP)),
        }
    }

    pub(crate) fn start_group(&self, topology: &GroupTopology) -> Result<(), CoreError> {
        self.inner.start_group(topology)
    }

    pub(crate) fn entity_store(&self) -> EntityStore<Organization> {
        self.inner.clone()
    }

    /// Organization by identifier, or [`CoreError::NotFound`].
    pub async fn get(
        &self,
        id: u64,
        level: ConsistencyLevel,
    ) -> Result<Organization, CoreError> {
        self.inner.get(id, level).await
    }

    /// Organization by identifier, or `None` when absent.
    pub async fn try_get(
        &self,
        id: u64,
        level: ConsistencyLevel,
    ) -> Result<Option<Organization>, CoreError> {
        self.inner.try_get(id, level).await
    }

    /// Persists the organization, deriving the id from the name when unset.
    /// Nested farms must already carry assigned ids; they are persisted
    /// through the farm store, not here.
    pub async fn save(&self, org: &mut Organization) -> Result<(), CoreError> {
        if org.name.is_empty() {
            return Err(CoreError::Config(
                "organization name is required".to_string(),
            ));
        }
        if !org.farms_keyed() {
            return Err(CoreError::Config(format!(
                "organization {:?} has farms without assigned ids",
                org.name
            )));
        }
        if org.id.is_zero() {
            org.id = loam_model::ids::OrgId::new(entity_id(&org.name));
        }
        self.inner.save(org).await
    }

    /// Removes an organization record.
    pub async fn delete(&self, id: u64) -> Result<(), CoreError> {
        self.inner.delete(id).await
    }

    /// Every organization, in identifier order.
    pub async fn get_all(
        &self,
        level: ConsistencyLevel,
    ) -> Result<Vec<Organization>, CoreError> {
        self.inner.get_all(level).await
    }

    /// One page of organizations.
    pub async fn get_page(
        &self,
        page: PageQuery,
        level: ConsistencyLevel,
    ) -> Result<EntityPage<Organization>, CoreError> {
        self.inner.get_page(page, level).await
    }
}

/// Store for control recipes.
#[derive(Clone)]
pub struct AlgorithmStore {
    inner: EntityStore<Algorithm>,
}

impl AlgorithmStore {
    pub(crate) fn new(host: Arc<GroupHost>) -> Self {
        AlgorithmStore {
            inner: EntityStore::new(host, entity_group(ALGORITHMS_GROUP)),
        }
    }

    pub(crate) fn start_group(&self, topology: &GroupTopology) -> Result<(), CoreError> {
        self.inner.start_group(topology)
    }

    /// Recipe by identifier, or [`CoreError::NotFound`].
    pub async fn get(&self, id: u64, level: ConsistencyLevel) -> Result<Algorithm, CoreError> {
        self.inner.get(id, level).await
    }

    /// Persists the recipe, deriving the id from the name when unset.
    pub async fn save(&self, algorithm: &mut Algorithm) -> Result<(), CoreError> {
        if algorithm.name.is_empty() {
            return Err(CoreError::Config("algorithm name is required".to_string()));
        }
        if algorithm.id == 0 {
            algorithm.id = entity_id(&algorithm.name);
        }
        self.inner.save(algorithm).await
    }

    /// Removes a recipe.
    pub async fn delete(&self, id: u64) -> Result<(), CoreError> {
        self.inner.delete(id).await
    }

    /// Every recipe, in identifier order.
    pub async fn get_all(&self, level: ConsistencyLevel) -> Result<Vec<Algorithm>, CoreError> {
        self.inner.get_all(level).await
    }

    /// One page of recipes.
    pub async fn get_page(
        &self,
        page: PageQuery,
        level: ConsistencyLevel,
    ) -> Result<EntityPage<Algorithm>, CoreError> {
        self.inner.get_page(page, level).await
    }
}

/// Store for pending sign-ups.
#[derive(Clone)]
pub struct RegistrationStore {
    inner: EntityStore<Registration>,
    users: UserStore,
}

impl RegistrationStore {
    pub(crate) fn new(host: Arc<GroupHost>, users: UserStore) -> Self {
        RegistrationStore {
            inner: EntityStore::new(host, entity_group(REGISTRATIONS_GROUP)),
            users,
        }
    }

    pub(crate) fn start_group(&self, topology: &GroupTopology) -> Result<(), CoreError> {
        self.inner.start_group(topology)
    }

    /// Pending sign-up by identifier, or [`CoreError::NotFound`].
    pub async fn get(
        &self,
        id: u64,
        level: ConsistencyLevel,
    ) -> Result<Registration, CoreError> {
        self.inner.get(id, level).await
    }

    /// Persists the sign-up, deriving the id from the email and stamping
    /// `created_at` when unset.
    pub async fn save(&self, registration: &mut Registration) -> Result<(), CoreError> {
        if registration.email.is_empty() {
            return Err(CoreError::Config(
                "registration email is required".to_string(),
            ));
        }
        let expected = entity_id(&registration.email);
        if registration.id == 0 {
            registration.id = expected;
        } else if registration.id != expected {
            return Err(CoreError::Config(format!(
                "registration id {} does not match email {:?}",
                registration.id, registration.email
            )));
        }
        if registration.created_at == 0 {
            registration.created_at = unix_nanos();
        }
        self.inner.save(registration).await
    }

    /// Removes a pending sign-up.
    pub async fn delete(&self, id: u64) -> Result<(), CoreError> {
        self.inner.delete(id).await
    }

    /// One page of pending sign-ups.
    pub async fn get_page(
        &self,
        page: PageQuery,
        level: ConsistencyLevel,
    ) -> Result<EntityPage<Registration>, CoreError> {
        self.inner.get_page(page, level).await
    }

    /// Turns a pending sign-up into an account. The caller supplies the
    /// already-hashed password; the registration is removed once the user
    /// exists. A failure after the user write is logged and returned, leaving
    /// the registration behind for a retry.
    pub async fn complete(
        &self,
        registration: &Registration,
        password_hash: &str,
    ) -> Result<User, CoreError> {
        let mut user = User::with_email(&registration.email);
        user.password_hash = password_hash.to_string();
        self.users.save(&mut user).await?;
        if let Err(e) = self.inner.delete(registration.id).await {
            tracing::warn!(
                email = %registration.email,
                error = %e,
                "sign-up completed but registration removal failed"
            );
            return Err(e);
        }
        info!(email = %user.email, user_id = %user.id, "sign-up completed");
        Ok(user)
    }
}

/// Every store over one replication host, with the entity groups started.
pub struct Dao {
    /// Server singleton store.
    pub servers: ServerStore,
    /// Organization store.
    pub orgs: OrgStore,
    /// User store.
    pub users: UserStore,
    /// Farm store with the save/delete cascades.
    pub farms: FarmStore,
    /// Pending sign-up store.
    pub registrations: RegistrationStore,
    /// Control recipe store.
    pub algorithms: AlgorithmStore,
    /// Per-farm event logs.
    pub events: EventLogStore,
    /// Per-device telemetry history.
    pub device_data: DeviceDataStore,
    /// Per-farm persisted live state.
    pub farm_states: FarmStateStore,
    /// Membership maintenance across users, organizations, and farms.
    pub permissions: PermissionStore,
}

impl Dao {
    /// Builds the store family and starts the six entity groups. Telemetry
    /// groups are derived per farm or device and started on first use.
    pub fn open(host: Arc<GroupHost>, topology: GroupTopology) -> Result<Dao, CoreError> {
        let servers = ServerStore::new(Arc::clone(&host));
        let orgs = OrgStore::new(Arc::clone(&host));
        let users = UserStore::new(Arc::clone(&host));
        let farms = FarmStore::new(Arc::clone(&host));
        let registrations = RegistrationStore::new(Arc::clone(&host), users.clone());
        let algorithms = AlgorithmStore::new(Arc::clone(&host));

        servers.start_group(&topology)?;
        orgs.start_group(&topology)?;
        users.start_group(&topology)?;
        farms.start_group(&topology)?;
        registrations.start_group(&topology)?;
        algorithms.start_group(&topology)?;

        let events = EventLogStore::new(Arc::clone(&host), topology.clone());
        let device_data = DeviceDataStore::new(Arc::clone(&host), topology.clone());
        let farm_states = FarmStateStore::new(Arc::clone(&host), topology);
        let permissions = PermissionStore::new(
            users.entity_store(),
            orgs.entity_store(),
            farms.entity_store(),
        );

        Ok(Dao {
            servers,
            orgs,
            users,
            farms,
            registrations,
            algorithms,
            events,
            device_data,
            farm_states,
            permissions,
        })
    }
}
