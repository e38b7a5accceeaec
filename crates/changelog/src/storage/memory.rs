use crate::error::Result;
use crate::storage::{KeyValueStore, KeyValues, ScanOrder, is_empty_range};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory KeyValueStore, nothing survives the process
///
/// Used by unit and model tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    trees: RwLock<BTreeMap<String, Tree>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn owned(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(key) => Bound::Included(key.to_vec()),
        Bound::Excluded(key) => Bound::Excluded(key.to_vec()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .trees
            .read()
            .get(tree)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn put(&self, tree: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.trees
            .write()
            .entry(tree.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, tree: &str, key: &[u8]) -> Result<bool> {
        let mut trees = self.trees.write();
        let Some(t) = trees.get_mut(tree) else {
            return Ok(false);
        };
        let removed = t.remove(key).is_some();
        if t.is_empty() {
            trees.remove(tree);
        }
        Ok(removed)
    }

    fn delete_range(
        &self,
        tree: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<usize> {
        if is_empty_range(lower, upper) {
            return Ok(0);
        }
        let mut trees = self.trees.write();
        let Some(t) = trees.get_mut(tree) else {
            return Ok(0);
        };
        let keys: Vec<Vec<u8>> = t
            .range((owned(lower), owned(upper)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            t.remove(key);
        }
        if t.is_empty() {
            trees.remove(tree);
        }
        Ok(keys.len())
    }

    fn scan(
        &self,
        tree: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        order: ScanOrder,
        limit: usize,
    ) -> Result<KeyValues> {
        if is_empty_range(lower, upper) {
            return Ok(Vec::new());
        }
        let trees = self.trees.read();
        let Some(t) = trees.get(tree) else {
            return Ok(Vec::new());
        };
        let range = t.range((owned(lower), owned(upper)));
        let clone = |(k, v): (&Vec<u8>, &Vec<u8>)| (k.clone(), v.clone());
        let out = match order {
            ScanOrder::Forward => range.take(limit).map(clone).collect(),
            ScanOrder::Backward => range.rev().take(limit).map(clone).collect(),
        };
        Ok(out)
    }

    fn drop_tree(&self, tree: &str) -> Result<()> {
        self.trees.write().remove(tree);
        Ok(())
    }

    fn list_trees(&self) -> Result<Vec<String>> {
        Ok(self.trees.read().keys().cloned().collect())
    }
}
