use crate::error::Result;
use std::ops::Bound;

/// Direction of a range scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Forward,
    Backward,
}

/// Key/value pairs returned by a scan
pub type KeyValues = Vec<(Vec<u8>, Vec<u8>)>;

/// Key-value storage abstraction for the changelog
///
/// Records live in named trees; keys are compared as raw bytes, which is
/// why every key the changelog writes (CSNs, change numbers) has a fixed
/// width big-endian encoding.
///
/// Key design principles:
/// - Single-key reads and writes are atomic
/// - Range scans are bounded and batched by the caller, no cursor state
///   lives in the store
/// - No knowledge of CSNs, domains or replication concerns
pub trait KeyValueStore: Send + Sync {
    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, tree: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Returns whether a record was removed
    fn delete(&self, tree: &str, key: &[u8]) -> Result<bool>;

    /// Remove every key within the bounds, returns how many were removed
    fn delete_range(&self, tree: &str, lower: Bound<&[u8]>, upper: Bound<&[u8]>)
    -> Result<usize>;

    /// Read at most `limit` records within the bounds, in key order
    fn scan(
        &self,
        tree: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        order: ScanOrder,
        limit: usize,
    ) -> Result<KeyValues>;

    /// Remove a tree and all its records
    fn drop_tree(&self, tree: &str) -> Result<()>;

    /// Names of the trees holding at least one record
    fn list_trees(&self) -> Result<Vec<String>>;
}

/// Hex form of a key, for logs and errors
pub(crate) fn hex_key(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Whether no key can satisfy both bounds
pub(crate) fn is_empty_range(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_empty_range() {
        let a: &[u8] = b"a";
        let b: &[u8] = b"b";
        assert!(!is_empty_range(Bound::Unbounded, Bound::Unbounded));
        assert!(!is_empty_range(Bound::Included(a), Bound::Included(a)));
        assert!(is_empty_range(Bound::Included(a), Bound::Excluded(a)));
        assert!(is_empty_range(Bound::Excluded(b), Bound::Included(a)));
        assert!(!is_empty_range(Bound::Excluded(a), Bound::Included(b)));
        assert!(!is_empty_range(Bound::Included(b), Bound::Unbounded));
    }
}
