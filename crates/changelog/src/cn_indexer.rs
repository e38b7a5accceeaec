use crate::cn_index_db::{CN_META_TREE, ChangeNumberIndexDB, CnIndexRecord};
use crate::csn::Csn;
use crate::cursor::{CursorOptions, DBCursor};
use crate::domain_db::ReplicationDomainDB;
use crate::error::Result;
use crate::multi_domain_state::MultiDomainServerState;
use crate::storage::KeyValueStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INDEXED_COOKIE_KEY: &[u8] = b"indexed_cookie";

/// Assigns change numbers to the changes every replica has caught up with
///
/// Changes are numbered in CSN order, and only up to the medium consistency
/// point: a change newer than the point could still be preceded by one a
/// lagging replica has not delivered yet, and numbering it now would break
/// the ordering of change numbers.
pub struct ChangeNumberIndexer<S> {
    domain_db: Arc<ReplicationDomainDB<S>>,
    cn_index_db: Arc<ChangeNumberIndexDB<S>>,
    storage: Arc<S>,
    excluded_domains: Vec<String>,
    /// Newest indexed CSN per (domain, replica)
    indexed: MultiDomainServerState,
    run_lock: Mutex<()>,
}

impl<S: KeyValueStore> ChangeNumberIndexer<S> {
    /// Restore the indexing position from the store
    pub fn new(
        domain_db: Arc<ReplicationDomainDB<S>>,
        cn_index_db: Arc<ChangeNumberIndexDB<S>>,
        storage: Arc<S>,
        excluded_domains: Vec<String>,
    ) -> Result<Self> {
        let indexed: MultiDomainServerState = match storage.get(CN_META_TREE, INDEXED_COOKIE_KEY)? {
            Some(raw) => match String::from_utf8_lossy(&raw).parse() {
                Ok(cookie) => cookie,
                Err(e) => {
                    warn!("Ignoring unreadable indexing cookie: {}", e);
                    MultiDomainServerState::new()
                }
            },
            None => MultiDomainServerState::new(),
        };

        // the cookie is saved after each record, it may miss the last one
        if let Some(newest) = cn_index_db.get_newest_record()? {
            indexed.update(&newest.domain, &newest.csn);
        }
        info!("Change number indexer starting from {}", indexed);

        Ok(Self {
            domain_db,
            cn_index_db,
            storage,
            excluded_domains,
            indexed,
            run_lock: Mutex::new(()),
        })
    }

    /// Position of the indexer, as a cookie
    pub fn indexed_cookie(&self) -> MultiDomainServerState {
        self.indexed.clone()
    }

    pub fn is_excluded(&self, domain: &str) -> bool {
        self.excluded_domains.iter().any(|d| d == domain)
    }

    /// Oldest medium consistency CSN over the indexed domains
    ///
    /// Domains whose replicas are all offline do not hold it back.
    pub fn medium_consistency_point(&self) -> Option<Csn> {
        self.domain_db
            .domains()
            .iter()
            .filter(|domain| !self.is_excluded(domain))
            .filter_map(|domain| self.domain_db.get_medium_consistency_csn(domain))
            .min()
    }

    /// Number every change not yet indexed up to the medium consistency point
    ///
    /// Returns how many changes were indexed.
    pub fn index_available_changes(&self) -> Result<usize> {
        let _guard = self.run_lock.lock();
        let Some(point) = self.medium_consistency_point() else {
            return Ok(0);
        };

        let mut cursor = self.domain_db.get_cursor_from_cookie(
            &self.indexed,
            CursorOptions::default(),
            &self.excluded_domains,
        )?;

        let mut count = 0;
        while cursor.next()? {
            let (domain, csn) = match (cursor.current_key(), cursor.record()) {
                (Some(domain), Some(msg)) => (domain.clone(), msg.csn),
                _ => break,
            };
            if csn > point {
                break;
            }

            let change_number = self.cn_index_db.next_change_number()?;
            self.cn_index_db
                .add_record(&CnIndexRecord::new(change_number, &domain, csn))?;
            self.indexed.update(&domain, &csn);
            self.save_cookie()?;
            count += 1;
        }
        cursor.close();

        if count > 0 {
            debug!("Indexed {} changes up to {}", count, point);
        }
        Ok(count)
    }

    /// Forget the indexing position of a removed domain
    pub fn remove_domain(&self, domain: &str) -> Result<()> {
        let _guard = self.run_lock.lock();
        self.indexed.remove_domain(domain);
        self.save_cookie()
    }

    fn save_cookie(&self) -> Result<()> {
        self.storage.put(
            CN_META_TREE,
            INDEXED_COOKIE_KEY,
            self.indexed.to_cookie().as_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::update_msg::UpdateMsg;
    use bytes::Bytes;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        domain_db: Arc<ReplicationDomainDB<MemoryStorage>>,
        cn_index_db: Arc<ChangeNumberIndexDB<MemoryStorage>>,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = Arc::new(MemoryStorage::new());
            Self {
                domain_db: Arc::new(ReplicationDomainDB::new(Arc::clone(&storage))),
                cn_index_db: Arc::new(ChangeNumberIndexDB::open(Arc::clone(&storage)).unwrap()),
                storage,
            }
        }

        fn indexer(&self, excluded: &[&str]) -> ChangeNumberIndexer<MemoryStorage> {
            ChangeNumberIndexer::new(
                Arc::clone(&self.domain_db),
                Arc::clone(&self.cn_index_db),
                Arc::clone(&self.storage),
                excluded.iter().map(|d| d.to_string()).collect(),
            )
            .unwrap()
        }

        fn publish(&self, domain: &str, time: u64, server_id: u16) {
            let msg = UpdateMsg::new(Csn::new(time, server_id, 0), "uuid", domain, Bytes::new());
            self.domain_db.publish_update_msg(domain, &msg).unwrap();
        }

        fn indexed(&self) -> Vec<(String, u64)> {
            let mut cursor = self.cn_index_db.get_cursor_from(1).unwrap();
            let mut out = Vec::new();
            while cursor.next().unwrap() {
                let record = cursor.record().unwrap();
                out.push((record.domain.clone(), record.csn.time()));
            }
            out
        }
    }

    #[test]
    fn test_indexes_up_to_medium_consistency_point() {
        let fx = Fixture::new();
        let indexer = fx.indexer(&[]);

        fx.publish("o=a", 10, 1);
        fx.publish("o=a", 30, 1);
        fx.publish("o=a", 20, 2);

        // replica 2 has only reached 20, so 30 must wait
        assert_eq!(indexer.index_available_changes().unwrap(), 2);
        assert_eq!(fx.indexed(), vec![("o=a".into(), 10), ("o=a".into(), 20)]);

        fx.domain_db.replica_heartbeat("o=a", &Csn::new(40, 2, 0));
        assert_eq!(indexer.index_available_changes().unwrap(), 1);
        assert_eq!(fx.indexed().last(), Some(&("o=a".to_string(), 30)));

        // nothing new
        assert_eq!(indexer.index_available_changes().unwrap(), 0);
    }

    #[test]
    fn test_excluded_domains_not_indexed() {
        let fx = Fixture::new();
        let indexer = fx.indexer(&["cn=admin data"]);

        fx.publish("cn=admin data", 5, 1);
        fx.publish("o=a", 10, 2);

        assert_eq!(indexer.index_available_changes().unwrap(), 1);
        assert_eq!(fx.indexed(), vec![("o=a".into(), 10)]);
    }

    #[test]
    fn test_resumes_after_restart() {
        let fx = Fixture::new();
        fx.publish("o=a", 10, 1);
        fx.publish("o=b", 20, 2);
        // the point is the oldest over all domains: o=a must move past 20
        fx.domain_db.replica_heartbeat("o=a", &Csn::new(25, 1, 0));
        assert_eq!(fx.indexer(&[]).index_available_changes().unwrap(), 2);

        fx.publish("o=a", 30, 1);
        fx.domain_db.replica_heartbeat("o=b", &Csn::new(30, 2, 0));

        let restarted = fx.indexer(&[]);
        assert_eq!(restarted.index_available_changes().unwrap(), 1);
        assert_eq!(
            fx.indexed(),
            vec![("o=a".into(), 10), ("o=b".into(), 20), ("o=a".into(), 30)]
        );
    }
}
