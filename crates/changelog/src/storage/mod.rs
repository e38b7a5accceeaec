mod memory;
mod sqlite;
mod storage_trait;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub(crate) use storage_trait::{hex_key, is_empty_range};
pub use storage_trait::{KeyValueStore, KeyValues, ScanOrder};
