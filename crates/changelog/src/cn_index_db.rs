use crate::csn::Csn;
use crate::cursor::{DBCursor, FETCH_SIZE, StoreCursor, StoredRecord, corrupt_record};
use crate::error::Result;
use crate::storage::{KeyValueStore, ScanOrder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const CN_INDEX_TREE: &str = "cn_index";
pub const CN_META_TREE: &str = "cn_meta";
const LAST_GENERATED_KEY: &[u8] = b"last_generated";

/// One change, numbered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CnIndexRecord {
    pub change_number: i64,
    pub domain: String,
    pub csn: Csn,
}

impl CnIndexRecord {
    pub fn new(change_number: i64, domain: impl Into<String>, csn: Csn) -> Self {
        Self {
            change_number,
            domain: domain.into(),
            csn,
        }
    }
}

/// Storage key of a change number
///
/// Change numbers start at 1, so the big-endian form sorts numerically.
fn cn_key(change_number: i64) -> [u8; 8] {
    change_number.max(0).to_be_bytes()
}

/// Decode an 8 byte big-endian integer stored at (or as) `key`
fn decode_i64(tree: &str, key: &[u8], bytes: &[u8]) -> Result<i64> {
    let fixed: [u8; 8] = bytes
        .try_into()
        .map_err(|_| corrupt_record(tree, key, format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(i64::from_be_bytes(fixed))
}

impl StoredRecord for CnIndexRecord {
    fn decode(tree: &str, key: &[u8], value: &[u8]) -> Result<Self> {
        let change_number = decode_i64(tree, key, key)?;
        let record: CnIndexRecord =
            serde_json::from_slice(value).map_err(|e| corrupt_record(tree, key, e.to_string()))?;
        if record.change_number != change_number {
            return Err(corrupt_record(
                tree,
                key,
                format!("record holds change number {}", record.change_number),
            ));
        }
        Ok(record)
    }
}

/// Cursor over the change number index
pub type ChangeNumberIndexDBCursor<S> = StoreCursor<S, CnIndexRecord>;

/// Sequential numbering of the changes of every domain
///
/// Change numbers are handed out by `next_change_number`, which persists
/// the counter before returning: a number may be lost to a crash but is
/// never handed out twice.
pub struct ChangeNumberIndexDB<S> {
    storage: Arc<S>,
    last_generated: Mutex<i64>,
}

impl<S: KeyValueStore> ChangeNumberIndexDB<S> {
    /// Open the index, restoring the change number counter
    pub fn open(storage: Arc<S>) -> Result<Self> {
        let persisted = match storage.get(CN_META_TREE, LAST_GENERATED_KEY)? {
            Some(value) => decode_i64(CN_META_TREE, LAST_GENERATED_KEY, &value)?,
            None => 0,
        };
        let db = Self {
            storage,
            last_generated: Mutex::new(persisted),
        };

        // the counter can lag behind the index if it was lost
        let newest = db.get_newest_record()?.map_or(0, |r| r.change_number);
        let last = persisted.max(newest);
        *db.last_generated.lock() = last;

        info!("Opened change number index, last change number {}", last);
        Ok(db)
    }

    /// Allocate the next change number
    pub fn next_change_number(&self) -> Result<i64> {
        let mut last = self.last_generated.lock();
        let next = *last + 1;
        self.storage
            .put(CN_META_TREE, LAST_GENERATED_KEY, &next.to_be_bytes())?;
        *last = next;
        Ok(next)
    }

    /// Last change number handed out, 0 when none ever was
    pub fn last_generated_change_number(&self) -> i64 {
        *self.last_generated.lock()
    }

    pub fn add_record(&self, record: &CnIndexRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.storage
            .put(CN_INDEX_TREE, &cn_key(record.change_number), &value)?;
        debug!(
            "Indexed change {} as {}:{}",
            record.change_number, record.domain, record.csn
        );
        Ok(())
    }

    pub fn get_record(&self, change_number: i64) -> Result<Option<CnIndexRecord>> {
        let key = cn_key(change_number);
        match self.storage.get(CN_INDEX_TREE, &key)? {
            Some(value) => Ok(Some(CnIndexRecord::decode(CN_INDEX_TREE, &key, &value)?)),
            None => Ok(None),
        }
    }

    pub fn get_oldest_record(&self) -> Result<Option<CnIndexRecord>> {
        self.boundary_record(ScanOrder::Forward)
    }

    pub fn get_newest_record(&self) -> Result<Option<CnIndexRecord>> {
        self.boundary_record(ScanOrder::Backward)
    }

    fn boundary_record(&self, order: ScanOrder) -> Result<Option<CnIndexRecord>> {
        let rows = self
            .storage
            .scan(CN_INDEX_TREE, Bound::Unbounded, Bound::Unbounded, order, 1)?;
        match rows.into_iter().next() {
            Some((key, value)) => Ok(Some(CnIndexRecord::decode(CN_INDEX_TREE, &key, &value)?)),
            None => Ok(None),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.get_newest_record_key()?.is_none())
    }

    fn get_newest_record_key(&self) -> Result<Option<Vec<u8>>> {
        let rows = self.storage.scan(
            CN_INDEX_TREE,
            Bound::Unbounded,
            Bound::Unbounded,
            ScanOrder::Backward,
            1,
        )?;
        Ok(rows.into_iter().next().map(|(key, _)| key))
    }

    /// Cursor over the records with a change number greater than or equal to `change_number`
    pub fn get_cursor_from(&self, change_number: i64) -> Result<ChangeNumberIndexDBCursor<S>> {
        let Some(newest) = self.get_newest_record_key()? else {
            return Ok(StoreCursor::empty(
                Arc::clone(&self.storage),
                CN_INDEX_TREE.to_string(),
            ));
        };
        Ok(StoreCursor::new(
            Arc::clone(&self.storage),
            CN_INDEX_TREE.to_string(),
            Bound::Included(cn_key(change_number).to_vec()),
            newest,
            None,
        ))
    }

    /// Remove the oldest records whose CSN is older than `csn`
    ///
    /// The newest record is always kept so the numbering can be resumed.
    /// Returns the CSN of the oldest remaining record.
    pub fn purge_up_to(&self, csn: &Csn) -> Result<Option<Csn>> {
        let Some(newest) = self.get_newest_record_key()? else {
            return Ok(None);
        };

        let mut lower: Bound<Vec<u8>> = Bound::Unbounded;
        loop {
            let rows = self.storage.scan(
                CN_INDEX_TREE,
                lower.as_ref().map(Vec::as_slice),
                Bound::Included(newest.as_slice()),
                ScanOrder::Forward,
                FETCH_SIZE,
            )?;
            let Some((last, _)) = rows.last() else {
                return Ok(None);
            };
            let last = last.clone();

            for (key, value) in &rows {
                match CnIndexRecord::decode(CN_INDEX_TREE, key, value) {
                    Ok(record) => {
                        if !record.csn.is_older_than(csn) || *key == newest {
                            let removed = self.storage.delete_range(
                                CN_INDEX_TREE,
                                Bound::Unbounded,
                                Bound::Excluded(key.as_slice()),
                            )?;
                            if removed > 0 {
                                debug!(
                                    "Purged {} change number records, oldest is now {}",
                                    removed, record.change_number
                                );
                            }
                            return Ok(Some(record.csn));
                        }
                    }
                    Err(e) => warn!("Skipping corrupt change number record: {}", e),
                }
            }
            lower = Bound::Excluded(last);
        }
    }

    /// Remove every record; the counter keeps going
    pub fn clear(&self) -> Result<()> {
        self.storage.drop_tree(CN_INDEX_TREE)?;
        info!("Cleared change number index");
        Ok(())
    }

    /// Remove the records of one domain, without renumbering the others
    ///
    /// Returns the number of records removed.
    pub fn clear_domain(&self, domain: &str) -> Result<usize> {
        let mut removed = 0;
        let mut cursor = self.get_cursor_from(0)?;
        let mut doomed = Vec::new();
        while cursor.next()? {
            if let Some(record) = cursor.record() {
                if record.domain == domain {
                    doomed.push(record.change_number);
                }
            }
        }
        for change_number in doomed {
            if self.storage.delete(CN_INDEX_TREE, &cn_key(change_number))? {
                removed += 1;
            }
        }
        info!("Removed {} change number records of {}", removed, domain);
        Ok(removed)
    }
}
