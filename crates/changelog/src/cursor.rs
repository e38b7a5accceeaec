use crate::csn::{Csn, CsnKeyed};
use crate::error::{ChangelogError, Result};
use crate::storage::{KeyValueStore, ScanOrder, hex_key};
use std::cmp::{Ordering, Reverse};
use std::collections::binary_heap::PeekMut;
use std::collections::{BinaryHeap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// Records read from the store per round trip
pub const FETCH_SIZE: usize = 64;

/// Forward cursor over changelog records
///
/// A new cursor sits before its first record: call `next()` to position
/// it. `record()` keeps returning the same record until `next()` is called
/// again. When no more records are available `next()` returns false, it
/// never waits for new data.
pub trait DBCursor {
    type Record;

    /// Move to the next record, returns false once exhausted
    fn next(&mut self) -> Result<bool>;

    /// Current record, `None` before the first `next()` or once exhausted
    fn record(&self) -> Option<&Self::Record>;

    /// Release the underlying store resources; the cursor is exhausted afterwards
    fn close(&mut self);
}

/// How the start key of a cursor is matched against the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMatchingStrategy {
    /// Only a record with exactly this key, otherwise the cursor is empty
    EqualToKey,
    /// The first record with a key greater than or equal to the start key
    #[default]
    GreaterThanOrEqualToKey,
    /// The last record with a key lower than or equal to the start key,
    /// the cursor is empty when there is none
    LessThanOrEqualToKey,
}

/// Where the cursor starts once a record has been matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionStrategy {
    OnMatchingKey,
    /// Skip the matched record if its key equals the start key
    #[default]
    AfterMatchingKey,
}

/// Start positioning of a cursor
///
/// The default (greater than or equal, after matching key) yields every
/// change strictly newer than the start CSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorOptions {
    pub key_matching: KeyMatchingStrategy,
    pub position: PositionStrategy,
}

impl CursorOptions {
    pub fn new(key_matching: KeyMatchingStrategy, position: PositionStrategy) -> Self {
        Self {
            key_matching,
            position,
        }
    }

    /// Start on the given key when it exists, else on the next one
    pub fn on_matching_key() -> Self {
        Self::new(
            KeyMatchingStrategy::GreaterThanOrEqualToKey,
            PositionStrategy::OnMatchingKey,
        )
    }
}

/// A record persisted in a tree of the key-value store
pub trait StoredRecord: Sized {
    /// Decode a record read from `tree`
    fn decode(tree: &str, key: &[u8], value: &[u8]) -> Result<Self>;
}

/// Error for a record that cannot be decoded
pub(crate) fn corrupt_record(tree: &str, key: &[u8], reason: impl Into<String>) -> ChangelogError {
    ChangelogError::CorruptRecord {
        tree: tree.to_string(),
        key: hex_key(key),
        reason: reason.into(),
    }
}

/// Keeps a per-log count of open cursors, decremented when released
pub(crate) struct CursorGuard {
    count: Arc<AtomicUsize>,
}

impl CursorGuard {
    pub(crate) fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, AtomicOrdering::SeqCst);
        Self {
            count: Arc::clone(count),
        }
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

/// Cursor over one tree of the store, reading in batches of `FETCH_SIZE`
///
/// The upper bound is fixed when the cursor is opened, so records written
/// afterwards are not seen.
pub struct StoreCursor<S, R> {
    storage: Arc<S>,
    tree: String,
    /// Everything up to this bound has been fetched
    lower: Bound<Vec<u8>>,
    /// Last key visible to the cursor, `None` for an empty cursor
    upper: Option<Vec<u8>>,
    buffer: VecDeque<R>,
    current: Option<R>,
    exhausted: bool,
    guard: Option<CursorGuard>,
}

impl<S: KeyValueStore, R: StoredRecord> StoreCursor<S, R> {
    pub(crate) fn new(
        storage: Arc<S>,
        tree: String,
        lower: Bound<Vec<u8>>,
        upper: Vec<u8>,
        guard: Option<CursorGuard>,
    ) -> Self {
        Self {
            storage,
            tree,
            lower,
            upper: Some(upper),
            buffer: VecDeque::new(),
            current: None,
            exhausted: false,
            guard,
        }
    }

    /// A cursor with no records
    pub fn empty(storage: Arc<S>, tree: String) -> Self {
        Self {
            storage,
            tree,
            lower: Bound::Unbounded,
            upper: None,
            buffer: VecDeque::new(),
            current: None,
            exhausted: true,
            guard: None,
        }
    }

    fn fetch(&mut self) -> Result<()> {
        let Some(upper) = self.upper.as_deref() else {
            self.exhausted = true;
            return Ok(());
        };
        let rows = self.storage.scan(
            &self.tree,
            self.lower.as_ref().map(Vec::as_slice),
            Bound::Included(upper),
            ScanOrder::Forward,
            FETCH_SIZE,
        )?;
        let last_batch = rows.len() < FETCH_SIZE;
        for (key, value) in rows {
            match R::decode(&self.tree, &key, &value) {
                Ok(record) => {
                    self.buffer.push_back(record);
                    self.lower = Bound::Excluded(key);
                }
                Err(e) if self.buffer.is_empty() => {
                    // skip the bad row so the next call moves on
                    self.lower = Bound::Excluded(key);
                    return Err(e);
                }
                // reported once the records before it have been read
                Err(_) => return Ok(()),
            }
        }
        if last_batch {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl<S: KeyValueStore, R: StoredRecord> DBCursor for StoreCursor<S, R> {
    type Record = R;

    fn next(&mut self) -> Result<bool> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch()?;
        }
        self.current = self.buffer.pop_front();
        if self.current.is_none() {
            self.close();
        }
        Ok(self.current.is_some())
    }

    fn record(&self) -> Option<&R> {
        self.current.as_ref()
    }

    fn close(&mut self) {
        self.buffer.clear();
        self.current = None;
        self.exhausted = true;
        self.guard = None;
    }
}

struct HeapEntry<K, C> {
    csn: Csn,
    key: K,
    cursor: C,
}

impl<K: Ord, C> PartialEq for HeapEntry<K, C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, C> Eq for HeapEntry<K, C> {}

impl<K: Ord, C> PartialOrd for HeapEntry<K, C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, C> Ord for HeapEntry<K, C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.csn
            .cmp(&other.csn)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// k-way merge of cursors yielding records in CSN order
///
/// Each underlying cursor is identified by a key (server id for a domain
/// cursor, domain name for a multi-domain cursor) which breaks ties
/// between equal CSNs coming from different sources. `next()` advances
/// only the cursor holding the current minimum, so a step costs
/// O(log n) for n cursors.
pub struct MergeCursor<K, C> {
    /// Cursors not positioned yet, they join the heap on the first `next()`
    pending: Vec<(K, C)>,
    heap: BinaryHeap<Reverse<HeapEntry<K, C>>>,
    started: bool,
}

impl<K, C> MergeCursor<K, C>
where
    K: Ord,
    C: DBCursor,
    C::Record: CsnKeyed,
{
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            heap: BinaryHeap::new(),
            started: false,
        }
    }

    /// Register a cursor; once the merge has started it is positioned right
    /// away and dropped if that fails
    pub fn add_cursor(&mut self, key: K, cursor: C) -> Result<()> {
        if self.started {
            self.push_advanced(key, cursor)
        } else {
            self.pending.push((key, cursor));
            Ok(())
        }
    }

    /// Key of the cursor holding the current record
    pub fn current_key(&self) -> Option<&K> {
        self.heap.peek().map(|Reverse(entry)| &entry.key)
    }

    /// Number of underlying cursors still holding records
    pub fn len(&self) -> usize {
        self.pending.len() + self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// On error the cursor is dropped
    fn push_advanced(&mut self, key: K, mut cursor: C) -> Result<()> {
        let has_record = cursor.next()?;
        self.push_positioned(key, cursor, has_record);
        Ok(())
    }

    fn push_positioned(&mut self, key: K, mut cursor: C, has_record: bool) {
        let csn = if has_record {
            cursor.record().map(|r| *r.csn())
        } else {
            None
        };
        match csn {
            Some(csn) => self.heap.push(Reverse(HeapEntry { csn, key, cursor })),
            None => cursor.close(),
        }
    }
}

impl<K, C> Default for MergeCursor<K, C>
where
    K: Ord,
    C: DBCursor,
    C::Record: CsnKeyed,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, C> DBCursor for MergeCursor<K, C>
where
    K: Ord,
    C: DBCursor,
    C::Record: CsnKeyed,
{
    type Record = C::Record;

    fn next(&mut self) -> Result<bool> {
        // a failing cursor keeps its place, so calling next() again retries it
        if !self.started {
            while let Some((key, mut cursor)) = self.pending.pop() {
                match cursor.next() {
                    Ok(has_record) => self.push_positioned(key, cursor, has_record),
                    Err(e) => {
                        self.pending.push((key, cursor));
                        return Err(e);
                    }
                }
            }
            self.started = true;
        } else if let Some(mut top) = self.heap.peek_mut() {
            let cursor = &mut top.0.cursor;
            let csn = if cursor.next()? {
                cursor.record().map(|r| *r.csn())
            } else {
                None
            };
            match csn {
                Some(csn) => top.0.csn = csn,
                None => {
                    let Reverse(mut entry) = PeekMut::pop(top);
                    entry.cursor.close();
                }
            }
        }
        Ok(!self.heap.is_empty())
    }

    fn record(&self) -> Option<&Self::Record> {
        self.heap
            .peek()
            .and_then(|Reverse(entry)| entry.cursor.record())
    }

    fn close(&mut self) {
        for (_, mut cursor) in self.pending.drain(..) {
            cursor.close();
        }
        for Reverse(mut entry) in self.heap.drain() {
            entry.cursor.close();
        }
        self.started = true;
    }
}
