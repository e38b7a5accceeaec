use crate::csn::Csn;
use crate::cursor::{
    CursorGuard, CursorOptions, FETCH_SIZE, KeyMatchingStrategy, PositionStrategy, StoreCursor,
    StoredRecord, corrupt_record,
};
use crate::error::{ChangelogError, Result};
use crate::storage::{KeyValueStore, ScanOrder, hex_key};
use crate::update_msg::UpdateMsg;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

const TREE_PREFIX: &str = "replica/";

/// Name of the tree holding the log of one replica in one domain
pub fn replica_tree_name(domain: &str, server_id: u16) -> String {
    format!("{}{}/{}", TREE_PREFIX, domain, server_id)
}

/// Inverse of `replica_tree_name`, `None` for trees that are not replica logs
pub fn parse_replica_tree_name(tree: &str) -> Option<(String, u16)> {
    let rest = tree.strip_prefix(TREE_PREFIX)?;
    let (domain, server_id) = rest.rsplit_once('/')?;
    let server_id = server_id.parse().ok()?;
    Some((domain.to_string(), server_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaDBStatus {
    /// Registered, nothing appended yet
    Created,
    Active,
    /// The oldest end of the log has been purged at least once
    Trimmed,
    Closed,
}

#[derive(Debug)]
struct ReplicaBounds {
    oldest: Option<Csn>,
    newest: Option<Csn>,
    status: ReplicaDBStatus,
}

/// Append-only log of the changes originated by one replica in one domain
///
/// Records are stored under their 14 byte CSN key, so the store's key order
/// is the log order. A single writer appends (the replica's own CSN
/// generator is the only issuer of its CSNs); readers use snapshot cursors
/// and never take the append lock.
pub struct ReplicaDB<S> {
    domain: String,
    server_id: u16,
    tree: String,
    storage: Arc<S>,
    bounds: RwLock<ReplicaBounds>,
    append_lock: Mutex<()>,
    open_cursors: Arc<AtomicUsize>,
}

impl<S: KeyValueStore> ReplicaDB<S> {
    /// Register a new, empty log
    pub fn create(storage: Arc<S>, domain: &str, server_id: u16) -> Self {
        debug!("Creating replica db {}/{}", domain, server_id);
        Self {
            domain: domain.to_string(),
            server_id,
            tree: replica_tree_name(domain, server_id),
            storage,
            bounds: RwLock::new(ReplicaBounds {
                oldest: None,
                newest: None,
                status: ReplicaDBStatus::Created,
            }),
            append_lock: Mutex::new(()),
            open_cursors: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reopen a log persisted by a previous run
    pub fn open(storage: Arc<S>, domain: &str, server_id: u16) -> Result<Self> {
        let db = Self::create(storage, domain, server_id);
        let oldest = db.boundary_csn(ScanOrder::Forward)?;
        let newest = db.boundary_csn(ScanOrder::Backward)?;
        {
            let mut bounds = db.bounds.write();
            bounds.oldest = oldest;
            bounds.newest = newest;
            if newest.is_some() {
                bounds.status = ReplicaDBStatus::Active;
            }
        }
        debug!(
            "Opened replica db {}/{}: oldest={:?} newest={:?}",
            domain, server_id, oldest, newest
        );
        Ok(db)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    pub fn status(&self) -> ReplicaDBStatus {
        self.bounds.read().status
    }

    pub fn oldest_csn(&self) -> Option<Csn> {
        self.bounds.read().oldest
    }

    pub fn newest_csn(&self) -> Option<Csn> {
        self.bounds.read().newest
    }

    /// Cursors opened on this log and not yet closed or dropped
    pub fn open_cursor_count(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    /// Append a change to the log
    pub fn append(&self, msg: &UpdateMsg) -> Result<()> {
        let _guard = self.append_lock.lock();
        if self.status() == ReplicaDBStatus::Closed {
            return Err(ChangelogError::Closed(self.tree.clone()));
        }

        let value = serde_json::to_vec(msg)?;
        self.storage.put(&self.tree, &msg.csn.to_bytes(), &value)?;

        let mut bounds = self.bounds.write();
        if bounds.oldest.is_none_or(|oldest| msg.csn < oldest) {
            bounds.oldest = Some(msg.csn);
        }
        if bounds.newest.is_none_or(|newest| msg.csn > newest) {
            bounds.newest = Some(msg.csn);
        }
        if bounds.status == ReplicaDBStatus::Created {
            bounds.status = ReplicaDBStatus::Active;
        }
        trace!("Appended {} to {}", msg.csn, self.tree);
        Ok(())
    }

    /// Open a cursor positioned from `start` according to `options`
    ///
    /// With no start CSN the cursor starts at the oldest record. The cursor
    /// only sees the records present when it was opened.
    pub fn cursor(&self, start: Option<&Csn>, options: CursorOptions) -> Result<ReplicaCursor<S>> {
        let (newest, closed) = {
            let bounds = self.bounds.read();
            (bounds.newest, bounds.status == ReplicaDBStatus::Closed)
        };
        let Some(newest) = newest else {
            return Ok(self.empty_cursor());
        };
        if closed {
            return Ok(self.empty_cursor());
        }

        let lower = match start {
            None => Some(Bound::Unbounded),
            Some(csn) => self.start_bound(csn, options)?,
        };
        let Some(lower) = lower else {
            return Ok(self.empty_cursor());
        };

        Ok(StoreCursor::new(
            Arc::clone(&self.storage),
            self.tree.clone(),
            lower,
            newest.to_bytes().to_vec(),
            Some(CursorGuard::new(&self.open_cursors)),
        ))
    }

    /// Lower scan bound for a start CSN, `None` when nothing can match
    fn start_bound(&self, csn: &Csn, options: CursorOptions) -> Result<Option<Bound<Vec<u8>>>> {
        let key = csn.to_bytes().to_vec();
        let matched = match options.key_matching {
            KeyMatchingStrategy::GreaterThanOrEqualToKey => Some(key.clone()),
            KeyMatchingStrategy::EqualToKey => {
                if self.storage.get(&self.tree, &key)?.is_some() {
                    Some(key.clone())
                } else {
                    None
                }
            }
            KeyMatchingStrategy::LessThanOrEqualToKey => self
                .storage
                .scan(
                    &self.tree,
                    Bound::Unbounded,
                    Bound::Included(key.as_slice()),
                    ScanOrder::Backward,
                    1,
                )?
                .into_iter()
                .next()
                .map(|(k, _)| k),
        };

        Ok(matched.map(|found| {
            if found == key && options.position == PositionStrategy::AfterMatchingKey {
                Bound::Excluded(found)
            } else {
                Bound::Included(found)
            }
        }))
    }

    fn empty_cursor(&self) -> ReplicaCursor<S> {
        ReplicaCursor::empty(Arc::clone(&self.storage), self.tree.clone())
    }

    /// Remove the records older than `csn`, always keeping the newest one
    ///
    /// Returns the number of records removed.
    pub fn purge_up_to(&self, csn: &Csn) -> Result<usize> {
        let _guard = self.append_lock.lock();
        let Some(newest) = self.newest_csn() else {
            return Ok(0);
        };

        let limit = (*csn).min(newest).to_bytes();
        let removed = self
            .storage
            .delete_range(&self.tree, Bound::Unbounded, Bound::Excluded(&limit[..]))?;

        if removed > 0 {
            let oldest = self.boundary_csn(ScanOrder::Forward)?;
            let mut bounds = self.bounds.write();
            bounds.oldest = oldest;
            if bounds.status == ReplicaDBStatus::Active {
                bounds.status = ReplicaDBStatus::Trimmed;
            }
            debug!("Purged {} records from {} up to {}", removed, self.tree, csn);
        }
        Ok(removed)
    }

    /// Remove every record of the log
    pub fn clear(&self) -> Result<()> {
        let _guard = self.append_lock.lock();
        self.storage.drop_tree(&self.tree)?;
        let mut bounds = self.bounds.write();
        bounds.oldest = None;
        bounds.newest = None;
        if bounds.status != ReplicaDBStatus::Closed {
            bounds.status = ReplicaDBStatus::Created;
        }
        Ok(())
    }

    /// Refuse further appends; new cursors are empty
    pub fn close(&self) {
        let _guard = self.append_lock.lock();
        self.bounds.write().status = ReplicaDBStatus::Closed;
        debug!("Closed replica db {}", self.tree);
    }

    /// First (or last) decodable CSN key, corrupt keys are skipped
    fn boundary_csn(&self, order: ScanOrder) -> Result<Option<Csn>> {
        let mut lower: Bound<Vec<u8>> = Bound::Unbounded;
        let mut upper: Bound<Vec<u8>> = Bound::Unbounded;
        loop {
            let rows = self.storage.scan(
                &self.tree,
                lower.as_ref().map(Vec::as_slice),
                upper.as_ref().map(Vec::as_slice),
                order,
                FETCH_SIZE,
            )?;
            let fetched = rows.len();
            for (key, _) in rows {
                match Csn::from_bytes(&key) {
                    Ok(csn) => return Ok(Some(csn)),
                    Err(e) => {
                        warn!("Skipping corrupt key {} in {}: {}", hex_key(&key), self.tree, e);
                        match order {
                            ScanOrder::Forward => lower = Bound::Excluded(key),
                            ScanOrder::Backward => upper = Bound::Excluded(key),
                        }
                    }
                }
            }
            if fetched < FETCH_SIZE {
                return Ok(None);
            }
        }
    }
}

/// Cursor over one replica's log
pub type ReplicaCursor<S> = StoreCursor<S, UpdateMsg>;

impl StoredRecord for UpdateMsg {
    fn decode(tree: &str, key: &[u8], value: &[u8]) -> Result<Self> {
        let csn = Csn::from_bytes(key).map_err(|e| corrupt_record(tree, key, e.to_string()))?;
        let msg: UpdateMsg =
            serde_json::from_slice(value).map_err(|e| corrupt_record(tree, key, e.to_string()))?;
        if msg.csn != csn {
            return Err(corrupt_record(
                tree,
                key,
                format!("record holds CSN {}", msg.csn),
            ));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::DBCursor;
    use crate::storage::MemoryStorage;

    fn msg(time: u64, server_id: u16) -> UpdateMsg {
        UpdateMsg::new(
            Csn::new(time, server_id, 0),
            format!("uuid-{}", time),
            "o=test",
            vec![time as u8],
        )
    }

    fn drain(cursor: &mut ReplicaCursor<MemoryStorage>) -> Vec<u64> {
        let mut out = Vec::new();
        while cursor.next().unwrap() {
            out.push(cursor.record().unwrap().csn.time());
        }
        out
    }

    fn db_with(times: &[u64]) -> ReplicaDB<MemoryStorage> {
        let db = ReplicaDB::create(Arc::new(MemoryStorage::new()), "o=test", 1);
        for t in times {
            db.append(&msg(*t, 1)).unwrap();
        }
        db
    }

    #[test]
    fn test_replica_tree_name() {
        let tree = replica_tree_name("dc=example/dc=com", 42);
        assert_eq!(tree, "replica/dc=example/dc=com/42");
        assert_eq!(
            parse_replica_tree_name(&tree),
            Some(("dc=example/dc=com".to_string(), 42))
        );
        assert_eq!(parse_replica_tree_name("cn_index"), None);
        assert_eq!(parse_replica_tree_name("replica/o=test/x"), None);
    }

    #[test]
    fn test_replica_db_append_and_bounds() {
        let db = db_with(&[]);
        assert_eq!(db.status(), ReplicaDBStatus::Created);
        assert_eq!(db.oldest_csn(), None);

        db.append(&msg(10, 1)).unwrap();
        db.append(&msg(20, 1)).unwrap();
        assert_eq!(db.status(), ReplicaDBStatus::Active);
        assert_eq!(db.oldest_csn(), Some(Csn::new(10, 1, 0)));
        assert_eq!(db.newest_csn(), Some(Csn::new(20, 1, 0)));
    }

    #[test]
    fn test_replica_cursor_batches() {
        let times: Vec<u64> = (1..=(FETCH_SIZE as u64 * 2 + 5)).collect();
        let db = db_with(&times);

        let mut cursor = db.cursor(None, CursorOptions::default()).unwrap();
        assert_eq!(drain(&mut cursor), times);
    }

    #[test]
    fn test_replica_cursor_strategies() {
        let db = db_with(&[10, 20, 30]);
        let at = |t: u64| Csn::new(t, 1, 0);
        let open = |csn: Csn, k, p| {
            let mut cursor = db.cursor(Some(&csn), CursorOptions::new(k, p)).unwrap();
            drain(&mut cursor)
        };
        use KeyMatchingStrategy::*;
        use PositionStrategy::*;

        assert_eq!(open(at(20), GreaterThanOrEqualToKey, AfterMatchingKey), vec![30]);
        assert_eq!(open(at(20), GreaterThanOrEqualToKey, OnMatchingKey), vec![20, 30]);
        assert_eq!(open(at(15), GreaterThanOrEqualToKey, AfterMatchingKey), vec![20, 30]);
        assert_eq!(open(at(35), GreaterThanOrEqualToKey, AfterMatchingKey), Vec::<u64>::new());

        assert_eq!(open(at(20), EqualToKey, OnMatchingKey), vec![20, 30]);
        assert_eq!(open(at(20), EqualToKey, AfterMatchingKey), vec![30]);
        assert_eq!(open(at(15), EqualToKey, OnMatchingKey), Vec::<u64>::new());

        assert_eq!(open(at(25), LessThanOrEqualToKey, AfterMatchingKey), vec![20, 30]);
        assert_eq!(open(at(20), LessThanOrEqualToKey, AfterMatchingKey), vec![30]);
        assert_eq!(open(at(5), LessThanOrEqualToKey, OnMatchingKey), Vec::<u64>::new());
    }

    #[test]
    fn test_replica_cursor_is_snapshot() {
        let db = db_with(&[10, 20]);
        let mut cursor = db.cursor(None, CursorOptions::default()).unwrap();
        db.append(&msg(30, 1)).unwrap();

        assert_eq!(drain(&mut cursor), vec![10, 20]);

        let mut reopened = db.cursor(None, CursorOptions::default()).unwrap();
        assert_eq!(drain(&mut reopened), vec![10, 20, 30]);
    }

    #[test]
    fn test_replica_cursor_count_released() {
        let db = db_with(&[10, 20]);
        let mut first = db.cursor(None, CursorOptions::default()).unwrap();
        let second = db.cursor(None, CursorOptions::default()).unwrap();
        assert_eq!(db.open_cursor_count(), 2);

        first.close();
        assert_eq!(db.open_cursor_count(), 1);
        drop(second);
        assert_eq!(db.open_cursor_count(), 0);

        let mut exhausted = db.cursor(None, CursorOptions::default()).unwrap();
        drain(&mut exhausted);
        assert_eq!(db.open_cursor_count(), 0);
    }

    #[test]
    fn test_replica_db_purge_keeps_newest() {
        let db = db_with(&[10, 20, 30]);

        assert_eq!(db.purge_up_to(&Csn::new(25, 1, 0)).unwrap(), 2);
        assert_eq!(db.oldest_csn(), Some(Csn::new(30, 1, 0)));
        assert_eq!(db.status(), ReplicaDBStatus::Trimmed);

        // a purge point past the newest record keeps the newest record
        assert_eq!(db.purge_up_to(&Csn::new(99, 1, 0)).unwrap(), 0);
        assert_eq!(db.newest_csn(), Some(Csn::new(30, 1, 0)));

        let mut cursor = db.cursor(None, CursorOptions::default()).unwrap();
        assert_eq!(drain(&mut cursor), vec![30]);
    }

    #[test]
    fn test_replica_db_reopen_skips_corrupt_keys() {
        let storage = Arc::new(MemoryStorage::new());
        let db = ReplicaDB::create(Arc::clone(&storage), "o=test", 1);
        db.append(&msg(10, 1)).unwrap();
        db.append(&msg(20, 1)).unwrap();
        storage
            .put(&replica_tree_name("o=test", 1), b"\x00bad", b"{}")
            .unwrap();

        let reopened = ReplicaDB::open(storage, "o=test", 1).unwrap();
        assert_eq!(reopened.oldest_csn(), Some(Csn::new(10, 1, 0)));
        assert_eq!(reopened.newest_csn(), Some(Csn::new(20, 1, 0)));
        assert_eq!(reopened.status(), ReplicaDBStatus::Active);
    }

    #[test]
    fn test_replica_cursor_reports_corrupt_record() {
        let storage = Arc::new(MemoryStorage::new());
        let db = ReplicaDB::create(Arc::clone(&storage), "o=test", 1);
        db.append(&msg(10, 1)).unwrap();
        storage
            .put(&replica_tree_name("o=test", 1), &Csn::new(10, 1, 0).to_bytes(), b"not json")
            .unwrap();

        let mut cursor = db.cursor(None, CursorOptions::default()).unwrap();
        assert!(matches!(
            cursor.next(),
            Err(ChangelogError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_replica_cursor_skips_only_corrupt_records() {
        let storage = Arc::new(MemoryStorage::new());
        let db = ReplicaDB::create(Arc::clone(&storage), "o=test", 1);
        let times: Vec<u64> = (1..=(FETCH_SIZE as u64 * 2 + 5)).collect();
        for t in &times {
            db.append(&msg(*t, 1)).unwrap();
        }
        let corrupt = [2, FETCH_SIZE as u64 + 2];
        for t in corrupt {
            storage
                .put(&replica_tree_name("o=test", 1), &Csn::new(t, 1, 0).to_bytes(), b"junk")
                .unwrap();
        }

        let mut cursor = db.cursor(None, CursorOptions::default()).unwrap();
        let mut seen = Vec::new();
        let mut errors = 0;
        loop {
            match cursor.next() {
                Ok(true) => seen.push(cursor.record().unwrap().csn.time()),
                Ok(false) => break,
                Err(ChangelogError::CorruptRecord { .. }) => errors += 1,
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert_eq!(errors, 2);
        let expected: Vec<u64> = times.into_iter().filter(|t| !corrupt.contains(t)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_replica_db_close_and_clear() {
        let db = db_with(&[10]);
        db.clear().unwrap();
        assert_eq!(db.newest_csn(), None);
        assert_eq!(db.status(), ReplicaDBStatus::Created);

        db.close();
        assert!(matches!(
            db.append(&msg(20, 1)),
            Err(ChangelogError::Closed(_))
        ));
        let mut cursor = db.cursor(None, CursorOptions::default()).unwrap();
        assert!(!cursor.next().unwrap());
    }
}
