use crate::csn::Csn;
use crate::cursor::{CursorOptions, MergeCursor};
use crate::error::{ChangelogError, Result};
use crate::multi_domain_state::MultiDomainServerState;
use crate::replica_db::{ReplicaCursor, ReplicaDB, parse_replica_tree_name, replica_tree_name};
use crate::server_state::ServerState;
use crate::storage::KeyValueStore;
use crate::update_msg::UpdateMsg;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace};

/// Merge of the replica cursors of one domain, keyed by server id
pub type DomainDBCursor<S> = MergeCursor<u16, ReplicaCursor<S>>;

/// Merge of domain cursors, keyed by domain name
pub type MultiDomainDBCursor<S> = MergeCursor<String, DomainDBCursor<S>>;

const GENERATION_TREE: &str = "generation_ids";

type ReplicaMap<S> = BTreeMap<u16, Arc<ReplicaDB<S>>>;

struct DomainEntry<S> {
    /// Read-copy-update: readers clone the Arc, writers swap in a new map
    replicas: RwLock<Arc<ReplicaMap<S>>>,
    /// Serializes the creation of ReplicaDBs
    create_lock: Mutex<()>,
    latest_trim: Mutex<Option<SystemTime>>,
}

impl<S> DomainEntry<S> {
    fn new() -> Self {
        Self {
            replicas: RwLock::new(Arc::new(BTreeMap::new())),
            create_lock: Mutex::new(()),
            latest_trim: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> Arc<ReplicaMap<S>> {
        self.replicas.read().clone()
    }
}

/// Replica logs of every replication domain
///
/// Each domain holds one append-only ReplicaDB per replica and is exposed
/// as a single CSN-ordered stream through merge cursors. The DB also tracks
/// replica liveness: publishes, heartbeats and offline markers move the
/// domain's medium consistency point forward.
pub struct ReplicationDomainDB<S> {
    storage: Arc<S>,
    domains: Mutex<HashMap<String, Arc<DomainEntry<S>>>>,
    /// Newest CSN each replica is known to have reached
    last_alive: MultiDomainServerState,
    /// Replicas explicitly taken offline, with the CSN they went offline at
    offline: MultiDomainServerState,
    last_seen: Mutex<HashMap<(String, u16), Instant>>,
}

impl<S: KeyValueStore> ReplicationDomainDB<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            domains: Mutex::new(HashMap::new()),
            last_alive: MultiDomainServerState::new(),
            offline: MultiDomainServerState::new(),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Open the replica logs found in the store
    ///
    /// Each replica's newest CSN seeds the liveness state, so the medium
    /// consistency point does not restart from scratch.
    pub fn open(storage: Arc<S>) -> Result<Self> {
        let db = Self::new(storage);
        for tree in db.storage.list_trees()? {
            let Some((domain, server_id)) = parse_replica_tree_name(&tree) else {
                continue;
            };
            let replica = Arc::new(ReplicaDB::open(
                Arc::clone(&db.storage),
                &domain,
                server_id,
            )?);
            if let Some(newest) = replica.newest_csn() {
                db.last_alive.update(&domain, &newest);
            }

            let entry = db.domain_entry(&domain);
            let mut replicas = (*entry.snapshot()).clone();
            replicas.insert(server_id, replica);
            *entry.replicas.write() = Arc::new(replicas);
        }
        info!("Opened changelog with {} domains", db.domains.lock().len());
        Ok(db)
    }

    fn domain_entry(&self, domain: &str) -> Arc<DomainEntry<S>> {
        let mut domains = self.domains.lock();
        Arc::clone(
            domains
                .entry(domain.to_string())
                .or_insert_with(|| Arc::new(DomainEntry::new())),
        )
    }

    fn find_domain(&self, domain: &str) -> Option<Arc<DomainEntry<S>>> {
        self.domains.lock().get(domain).cloned()
    }

    fn replicas(&self, domain: &str) -> Arc<ReplicaMap<S>> {
        self.find_domain(domain)
            .map(|entry| entry.snapshot())
            .unwrap_or_default()
    }

    /// Known domains, sorted
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.domains.lock().keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Server ids holding a ReplicaDB in `domain`
    pub fn server_ids(&self, domain: &str) -> Vec<u16> {
        self.replicas(domain).keys().copied().collect()
    }

    pub fn get_replica_db(&self, domain: &str, server_id: u16) -> Option<Arc<ReplicaDB<S>>> {
        self.replicas(domain).get(&server_id).cloned()
    }

    fn get_or_create_replica(&self, domain: &str, server_id: u16) -> (Arc<ReplicaDB<S>>, bool) {
        let entry = self.domain_entry(domain);
        if let Some(replica) = entry.snapshot().get(&server_id) {
            return (Arc::clone(replica), false);
        }

        let _guard = entry.create_lock.lock();
        let current = entry.snapshot();
        if let Some(replica) = current.get(&server_id) {
            return (Arc::clone(replica), false);
        }

        let replica = Arc::new(ReplicaDB::create(
            Arc::clone(&self.storage),
            domain,
            server_id,
        ));
        let mut replicas = (*current).clone();
        replicas.insert(server_id, Arc::clone(&replica));
        *entry.replicas.write() = Arc::new(replicas);
        info!("Created replica db for server {} in {}", server_id, domain);
        (replica, true)
    }

    /// Append a change to the log of the replica that issued its CSN
    ///
    /// Returns whether the ReplicaDB had to be created.
    pub fn publish_update_msg(&self, domain: &str, msg: &UpdateMsg) -> Result<bool> {
        let (replica, created) = self.get_or_create_replica(domain, msg.csn.server_id());
        replica.append(msg)?;
        self.mark_alive(domain, &msg.csn);
        Ok(created)
    }

    /// Record that a replica reached `csn`, clearing a stale offline marker
    fn mark_alive(&self, domain: &str, csn: &Csn) {
        self.last_alive.update(domain, csn);
        if let Some(offline) = self.offline.get_csn(domain, csn.server_id()) {
            if csn.is_newer_than(&offline) && self.offline.remove_csn(domain, &offline) {
                info!("Server {} in {} is back online at {}", csn.server_id(), domain, csn);
            }
        }
        self.last_seen
            .lock()
            .insert((domain.to_string(), csn.server_id()), Instant::now());
    }

    /// A replica is alive as of `csn`, without appending a change
    pub fn replica_heartbeat(&self, domain: &str, csn: &Csn) {
        trace!("Heartbeat from server {} in {}: {}", csn.server_id(), domain, csn);
        self.mark_alive(domain, csn);
    }

    /// A replica was stopped on purpose at `csn`
    ///
    /// Unlike silence, this lets the medium consistency point move past
    /// the replica until it publishes or heartbeats again.
    pub fn replica_offline(&self, domain: &str, csn: &Csn) {
        info!("Server {} in {} is offline at {}", csn.server_id(), domain, csn);
        self.last_alive.update(domain, csn);
        self.offline.update(domain, csn);
    }

    /// Oldest CSN every online replica of `domain` is known to have reached
    pub fn get_medium_consistency_csn(&self, domain: &str) -> Option<Csn> {
        let alive = self.last_alive.get_server_state(domain)?;
        let offline = self.offline.get_server_state(domain).unwrap_or_default();
        alive.oldest_csn_excluding(&offline).copied()
    }

    /// Medium consistency point across all domains
    pub fn get_medium_consistency_point(&self) -> Option<(String, Csn)> {
        self.last_alive.get_oldest_csn_excluding(&self.offline)
    }

    /// Replicas not offline and silent for longer than `timeout`
    ///
    /// Informational: silence never moves the medium consistency point.
    pub fn get_stale_replicas(&self, domain: &str, timeout: Duration) -> Vec<u16> {
        let Some(alive) = self.last_alive.get_server_state(domain) else {
            return Vec::new();
        };
        let offline = self.offline.get_server_state(domain).unwrap_or_default();
        let last_seen = self.last_seen.lock();
        alive
            .iter()
            .filter(|csn| !offline.cover(csn))
            .map(|csn| csn.server_id())
            .filter(|server_id| {
                last_seen
                    .get(&(domain.to_string(), *server_id))
                    .is_none_or(|seen| seen.elapsed() > timeout)
            })
            .collect()
    }

    /// Snapshot of the newest CSN known per replica, over all domains
    pub fn last_alive_state(&self) -> MultiDomainServerState {
        self.last_alive.clone()
    }

    /// Offline markers currently in effect
    pub fn offline_state(&self) -> MultiDomainServerState {
        self.offline.clone()
    }

    /// Cursor over one replica's log
    pub fn get_replica_cursor_from(
        &self,
        domain: &str,
        server_id: u16,
        start: Option<&Csn>,
        options: CursorOptions,
    ) -> Result<ReplicaCursor<S>> {
        match self.get_replica_db(domain, server_id) {
            Some(replica) => replica.cursor(start, options),
            None => Ok(ReplicaCursor::empty(
                Arc::clone(&self.storage),
                replica_tree_name(domain, server_id),
            )),
        }
    }

    /// Cursor over the whole domain, every replica starting from `start`
    pub fn get_domain_cursor_from_csn(
        &self,
        domain: &str,
        start: &Csn,
        options: CursorOptions,
    ) -> Result<DomainDBCursor<S>> {
        let mut cursor = MergeCursor::new();
        for (server_id, replica) in self.replicas(domain).iter() {
            cursor.add_cursor(*server_id, replica.cursor(Some(start), options)?)?;
        }
        Ok(cursor)
    }

    /// Cursor over the whole domain, each replica starting from its CSN in `state`
    ///
    /// Replicas missing from `state` are read from their oldest record.
    pub fn get_domain_cursor_from(
        &self,
        domain: &str,
        state: &ServerState,
        options: CursorOptions,
    ) -> Result<DomainDBCursor<S>> {
        let mut cursor = MergeCursor::new();
        for (server_id, replica) in self.replicas(domain).iter() {
            cursor.add_cursor(*server_id, replica.cursor(state.csn(*server_id), options)?)?;
        }
        Ok(cursor)
    }

    /// Cursor over every domain not in `excluded`, resuming from a cookie
    pub fn get_cursor_from_cookie(
        &self,
        cookie: &MultiDomainServerState,
        options: CursorOptions,
        excluded: &[String],
    ) -> Result<MultiDomainDBCursor<S>> {
        let mut cursor = MergeCursor::new();
        for domain in self.domains() {
            if excluded.contains(&domain) {
                continue;
            }
            let state = cookie.get_server_state(&domain).unwrap_or_default();
            let domain_cursor = self.get_domain_cursor_from(&domain, &state, options)?;
            cursor.add_cursor(domain, domain_cursor)?;
        }
        Ok(cursor)
    }

    /// Oldest retained CSN of each replica of `domain`
    pub fn get_domain_oldest_csns(&self, domain: &str) -> ServerState {
        self.replicas(domain)
            .values()
            .filter_map(|replica| replica.oldest_csn())
            .collect()
    }

    /// Newest CSN of each replica of `domain`
    pub fn get_domain_newest_csns(&self, domain: &str) -> ServerState {
        self.replicas(domain)
            .values()
            .filter_map(|replica| replica.newest_csn())
            .collect()
    }

    /// Trim every replica log up to `csn`, keeping each replica's newest change
    ///
    /// Returns the number of changes removed.
    pub fn purge_up_to(&self, csn: &Csn) -> Result<usize> {
        let entries: Vec<(String, Arc<DomainEntry<S>>)> = self
            .domains
            .lock()
            .iter()
            .map(|(domain, entry)| (domain.clone(), Arc::clone(entry)))
            .collect();
        let trim_date = UNIX_EPOCH + Duration::from_millis(csn.time());

        let mut removed = 0;
        for (domain, entry) in entries {
            for replica in entry.snapshot().values() {
                removed += replica.purge_up_to(csn)?;
            }
            *entry.latest_trim.lock() = Some(trim_date);
            debug!("Trimmed {} up to {}", domain, csn);
        }
        Ok(removed)
    }

    /// When `domain` was last trimmed
    pub fn get_domain_latest_trim_date(&self, domain: &str) -> Option<SystemTime> {
        self.find_domain(domain)
            .and_then(|entry| *entry.latest_trim.lock())
    }

    /// Delete every ReplicaDB of `domain` and forget its replicas
    ///
    /// Returns whether the domain was known.
    pub fn remove_domain(&self, domain: &str) -> Result<bool> {
        let entry = self.domains.lock().remove(domain);
        let known = entry.is_some();
        if let Some(entry) = entry {
            let _guard = entry.create_lock.lock();
            for replica in entry.snapshot().values() {
                replica.close();
                replica.clear()?;
            }
            *entry.replicas.write() = Arc::new(BTreeMap::new());
        }

        self.last_alive.remove_domain(domain);
        self.offline.remove_domain(domain);
        self.last_seen.lock().retain(|(d, _), _| d != domain);
        self.storage.delete(GENERATION_TREE, domain.as_bytes())?;

        if known {
            info!("Removed domain {}", domain);
        }
        Ok(known)
    }

    /// Persist the generation id of a domain
    pub fn set_generation_id(&self, domain: &str, generation_id: i64) -> Result<()> {
        self.storage.put(
            GENERATION_TREE,
            domain.as_bytes(),
            &generation_id.to_be_bytes(),
        )?;
        debug!("Generation id of {} set to {}", domain, generation_id);
        Ok(())
    }

    pub fn get_generation_id(&self, domain: &str) -> Result<Option<i64>> {
        let Some(value) = self.storage.get(GENERATION_TREE, domain.as_bytes())? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = value.as_slice().try_into().map_err(|_| {
            ChangelogError::CorruptRecord {
                tree: GENERATION_TREE.to_string(),
                key: domain.to_string(),
                reason: format!("expected 8 bytes, got {}", value.len()),
            }
        })?;
        Ok(Some(i64::from_be_bytes(bytes)))
    }

    /// Close every ReplicaDB; appends fail afterwards
    pub fn shutdown(&self) {
        let entries: Vec<Arc<DomainEntry<S>>> = self.domains.lock().values().cloned().collect();
        for entry in entries {
            for replica in entry.snapshot().values() {
                replica.close();
            }
        }
        info!("Changelog domain db closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::DBCursor;
    use crate::storage::MemoryStorage;
    use bytes::Bytes;

    fn db() -> ReplicationDomainDB<MemoryStorage> {
        ReplicationDomainDB::new(Arc::new(MemoryStorage::new()))
    }

    fn msg(time: u64, server_id: u16) -> UpdateMsg {
        UpdateMsg::new(Csn::new(time, server_id, 0), "uuid", "o=test", Bytes::new())
    }

    #[test]
    fn test_publish_creates_replica_once() {
        let db = db();
        assert!(db.publish_update_msg("o=test", &msg(1, 1)).unwrap());
        assert!(!db.publish_update_msg("o=test", &msg(2, 1)).unwrap());
        assert!(db.publish_update_msg("o=test", &msg(3, 2)).unwrap());

        assert_eq!(db.server_ids("o=test"), vec![1, 2]);
        assert_eq!(db.domains(), vec!["o=test".to_string()]);
        assert!(db.server_ids("o=other").is_empty());
    }

    #[test]
    fn test_domain_cursor_merges_replicas() {
        let db = db();
        db.publish_update_msg("o=test", &msg(2, 2)).unwrap();
        db.publish_update_msg("o=test", &msg(1, 1)).unwrap();
        db.publish_update_msg("o=test", &msg(3, 1)).unwrap();

        let mut cursor = db
            .get_domain_cursor_from("o=test", &ServerState::new(), CursorOptions::default())
            .unwrap();
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push(cursor.record().unwrap().csn);
        }
        assert_eq!(
            seen,
            vec![Csn::new(1, 1, 0), Csn::new(2, 2, 0), Csn::new(3, 1, 0)]
        );
    }

    #[test]
    fn test_unknown_replica_cursor_is_empty() {
        let db = db();
        let mut cursor = db
            .get_replica_cursor_from("o=test", 7, None, CursorOptions::default())
            .unwrap();
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_offline_marker_cleared_by_newer_csn() {
        let db = db();
        db.replica_heartbeat("o=test", &Csn::new(10, 1, 0));
        db.replica_offline("o=test", &Csn::new(5, 2, 0));
        assert_eq!(
            db.get_medium_consistency_csn("o=test"),
            Some(Csn::new(10, 1, 0))
        );

        // replica 2 comes back: it holds the point again
        db.replica_heartbeat("o=test", &Csn::new(6, 2, 0));
        assert!(db.offline_state().get_csn("o=test", 2).is_none());
        assert_eq!(
            db.get_medium_consistency_csn("o=test"),
            Some(Csn::new(6, 2, 0))
        );
    }

    #[test]
    fn test_remove_domain_refuses_late_appends() {
        let storage = Arc::new(MemoryStorage::new());
        let db = ReplicationDomainDB::new(Arc::clone(&storage));
        db.publish_update_msg("o=test", &msg(1, 1)).unwrap();
        let replica = db.get_replica_db("o=test", 1).unwrap();

        assert!(db.remove_domain("o=test").unwrap());
        assert!(matches!(
            replica.append(&msg(2, 1)),
            Err(ChangelogError::Closed(_))
        ));
        assert_eq!(replica.newest_csn(), None);

        let reopened = ReplicationDomainDB::open(storage).unwrap();
        assert!(reopened.domains().is_empty());
    }

    #[test]
    fn test_generation_id() {
        let db = db();
        assert_eq!(db.get_generation_id("o=test").unwrap(), None);
        db.set_generation_id("o=test", 42).unwrap();
        assert_eq!(db.get_generation_id("o=test").unwrap(), Some(42));
    }
}
