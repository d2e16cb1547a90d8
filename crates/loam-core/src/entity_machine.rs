//! Generic state machine for JSON-encoded entity records.
//!
//! One machine instance serves one record family (farms, users, ...) in one
//! replication group. Records are stored as the JSON bytes that were
//! proposed, keyed by the record's 64-bit identity in big-endian form so
//! iteration order follows identifier order.

use std::io::{Read, Write};
use std::marker::PhantomData;
use std::sync::Arc;

use loam_model::algorithm::Algorithm;
use loam_model::codec;
use loam_model::farm::Farm;
use loam_model::idgen::uint64_key;
use loam_model::org::Organization;
use loam_model::server::Server;
use loam_model::state::FarmStateMap;
use loam_model::user::{Registration, User};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::kvstore::{Kv, WriteBatch};
use crate::machine::{paginate, Proposal, ProposalOp, Query, QueryOutput, StateMachine};
use crate::types::{CoreError, LogEntry, SortOrder};

/// Stable numeric identity of a stored record.
pub trait Keyed {
    /// The identifier the record is stored under.
    fn key(&self) -> u64;
}

impl Keyed for Server {
    fn key(&self) -> u64 {
        self.id
    }
}

impl Keyed for Organization {
    fn key(&self) -> u64 {
        self.id.as_u64()
    }
}

impl Keyed for User {
    fn key(&self) -> u64 {
        self.id.as_u64()
    }
}

impl Keyed for Farm {
    fn key(&self) -> u64 {
        self.id.as_u64()
    }
}

impl Keyed for Registration {
    fn key(&self) -> u64 {
        self.id
    }
}

impl Keyed for Algorithm {
    fn key(&self) -> u64 {
        self.id
    }
}

impl Keyed for FarmStateMap {
    fn key(&self) -> u64 {
        self.farm_id.as_u64()
    }
}

/// JSON-record state machine over a [`Kv`] store.
pub struct EntityMachine<T> {
    kv: Arc<dyn Kv>,
    _entity: PhantomData<fn() -> T>,
}

/// Machine persisting one [`FarmStateMap`] per farm-state group.
pub type FarmStateMachine = EntityMachine<FarmStateMap>;

impl<T> EntityMachine<T>
where
    T: Keyed + Serialize + DeserializeOwned + Send + Sync,
{
    /// Creates a machine over the given store.
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        EntityMachine {
            kv,
            _entity: PhantomData,
        }
    }
}

impl<T> StateMachine for EntityMachine<T>
where
    T: Keyed + Serialize + DeserializeOwned + Send + Sync,
{
    fn update(&self, entries: &[LogEntry]) -> Result<(), CoreError> {
        let mut batch = WriteBatch::new();
        for entry in entries {
            let proposal = Proposal::decode(&entry.data)?;
            match proposal.op {
                ProposalOp::Update => {
                    // Decode only to learn the key; the stored value is the
                    // proposed bytes unchanged.
                    let record: T = codec::from_bytes(&proposal.data)?;
                    batch.put(
                        entry.index.as_u64(),
                        uint64_key(record.key()).to_vec(),
                        proposal.data,
                    );
                }
                ProposalOp::Delete => {
                    let id = proposal.delete_target()?;
                    batch.delete(entry.index.as_u64(), uint64_key(id).to_vec());
                }
            }
        }
        self.kv.apply_batch(&batch)
    }

    fn lookup(&self, query: &Query) -> Result<QueryOutput, CoreError> {
        match query {
            Query::Point(id) => Ok(QueryOutput::Value(self.kv.lookup(&uint64_key(*id))?)),
            Query::Wildcard => {
                let values = self
                    .kv
                    .iterate(SortOrder::Asc)?
                    .into_iter()
                    .map(|(_, v)| v)
                    .collect();
                Ok(QueryOutput::Values(values))
            }
            Query::Page(page) => {
                let values = self
                    .kv
                    .iterate(page.sort_order)?
                    .into_iter()
                    .map(|(_, v)| v)
                    .collect();
                Ok(QueryOutput::Page(paginate(values, page)))
            }
        }
    }

    fn applied_index(&self) -> Result<u64, CoreError> {
        self.kv.applied_index()
    }

    fn sync(&self) -> Result<(), CoreError> {
        self.kv.sync()
    }

    fn prepare_snapshot(&self) -> Result<u64, CoreError> {
        self.kv.prepare_snapshot()
    }

    fn save_snapshot(&self, view: u64, w: &mut dyn Write) -> Result<(), CoreError> {
        self.kv.save_snapshot(view, w)
    }

    fn recover_from_snapshot(&self, r: &mut dyn Read) -> Result<(), CoreError> {
        self.kv.recover_from_snapshot(r)
    }

    fn close(&self) -> Result<(), CoreError> {
        self.kv.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKv;
    use crate::machine::PageQuery;
    use crate::types::{LogIndex, Term};
    use loam_model::ids::FarmId;
    use loam_model::state::DeviceStateMap;

    fn machine<T>() -> EntityMachine<T>
    where
        T: Keyed + Serialize + DeserializeOwned + Send + Sync,
    {
        EntityMachine::new(Arc::new(MemoryKv::new()))
    }

    fn entry(index: u64, proposal: &Proposal) -> LogEntry {
        LogEntry {
            index: LogIndex::new(index),
            term: Term::new(1),
            data: proposal.encode().unwrap(),
        }
    }

    fn save_user(m: &EntityMachine<User>, index: u64, user: &User) {
        let proposal = Proposal::update(codec::to_bytes(user).unwrap());
        m.update(&[entry(index, &proposal)]).unwrap();
    }

    fn user(email: &str) -> User {
        User::with_email(email)
    }

    #[test]
    fn test_update_then_point_lookup() {
        let m = machine::<User>();
        let u = user("root@localhost");
        save_user(&m, 1, &u);

        let out = m.lookup(&Query::Point(u.id.as_u64())).unwrap();
        match out {
            QueryOutput::Value(Some(bytes)) => {
                let got: User = codec::from_bytes(&bytes).unwrap();
                assert_eq!(got.email, "root@localhost");
            }
            other => panic!("expected stored value, got {:?}", other),
        }
    }

    #[test]
    fn test_point_lookup_missing_is_none() {
        let m = machine::<User>();
        let out = m.lookup(&Query::Point(7)).unwrap();
        assert_eq!(out, QueryOutput::Value(None));
    }

    #[test]
    fn test_delete_removes_record() {
        let m = machine::<User>();
        let u = user("gone@example.com");
        save_user(&m, 1, &u);
        m.update(&[entry(2, &Proposal::delete(u.id.as_u64()))])
            .unwrap();

        let out = m.lookup(&Query::Point(u.id.as_u64())).unwrap();
        assert_eq!(out, QueryOutput::Value(None));
    }

    #[test]
    fn test_replayed_entry_is_noop() {
        let m = machine::<User>();
        let first = user("a@example.com");
        save_user(&m, 1, &first);

        // Same index with different content must not apply again.
        let mut stale = first.clone();
        stale.email = "tampered@example.com".to_string();
        let proposal = Proposal::update(codec::to_bytes(&stale).unwrap());
        m.update(&[entry(1, &proposal)]).unwrap();

        let out = m.lookup(&Query::Point(first.id.as_u64())).unwrap();
        match out {
            QueryOutput::Value(Some(bytes)) => {
                let got: User = codec::from_bytes(&bytes).unwrap();
                assert_eq!(got.email, "a@example.com");
            }
            other => panic!("expected stored value, got {:?}", other),
        }
        assert_eq!(m.applied_index().unwrap(), 1);
    }

    #[test]
    fn test_wildcard_returns_all_records() {
        let m = machine::<User>();
        save_user(&m, 1, &user("a@example.com"));
        save_user(&m, 2, &user("b@example.com"));
        save_user(&m, 3, &user("c@example.com"));

        let out = m.lookup(&Query::Wildcard).unwrap();
        match out {
            QueryOutput::Values(values) => assert_eq!(values.len(), 3),
            other => panic!("expected values, got {:?}", other),
        }
    }

    #[test]
    fn test_page_lookup_pages_through_records() {
        let m = machine::<User>();
        for i in 0..5 {
            save_user(&m, i + 1, &user(&format!("user{}@example.com", i)));
        }

        let out = m
            .lookup(&Query::Page(PageQuery {
                page: 1,
                page_size: 3,
                sort_order: SortOrder::Asc,
            }))
            .unwrap();
        match out {
            QueryOutput::Page(page) => {
                assert_eq!(page.items.len(), 3);
                assert!(page.has_more);
            }
            other => panic!("expected page, got {:?}", other),
        }
    }

    #[test]
    fn test_farm_records_round_trip() {
        let m = machine::<Farm>();
        let mut farm = Farm::default();
        farm.id = FarmId::new(10);
        farm.name = "North Field".to_string();
        let proposal = Proposal::update(codec::to_bytes(&farm).unwrap());
        m.update(&[entry(1, &proposal)]).unwrap();

        let out = m.lookup(&Query::Point(10)).unwrap();
        match out {
            QueryOutput::Value(Some(bytes)) => {
                let got: Farm = codec::from_bytes(&bytes).unwrap();
                assert_eq!(got.name, "North Field");
            }
            other => panic!("expected stored value, got {:?}", other),
        }
    }

    #[test]
    fn test_farm_state_machine_keeps_single_record() {
        let m: FarmStateMachine = machine::<FarmStateMap>();
        let mut state = FarmStateMap {
            farm_id: FarmId::new(4),
            ..FarmStateMap::default()
        };
        state
            .devices
            .insert("pump".to_string(), DeviceStateMap::default());
        let proposal = Proposal::update(codec::to_bytes(&state).unwrap());
        m.update(&[entry(1, &proposal)]).unwrap();

        // A second save for the same farm replaces the record.
        state.devices.clear();
        let proposal = Proposal::update(codec::to_bytes(&state).unwrap());
        m.update(&[entry(2, &proposal)]).unwrap();

        let out = m.lookup(&Query::Wildcard).unwrap();
        match out {
            QueryOutput::Values(values) => {
                assert_eq!(values.len(), 1);
                let got: FarmStateMap = codec::from_bytes(&values[0]).unwrap();
                assert!(got.devices.is_empty());
            }
            other => panic!("expected values, got {:?}", other),
        }
    }

    #[test]
    fn test_user_id_matches_email_derivation() {
        let u = user("root@localhost");
        assert_eq!(u.id, User::id_for_email("root@localhost"));
    }
}
