// Change identity
pub mod csn;
pub mod csn_generator;
pub mod multi_domain_state;
pub mod server_state;

// Storage and cursors
pub mod cn_index_db;
pub mod cursor;
pub mod domain_db;
pub mod replica_db;
pub mod storage;
pub mod update_msg;

// Service
pub mod cn_indexer;
pub mod config;
pub mod error;
pub mod service;

// Public exports
pub use cn_index_db::{ChangeNumberIndexDB, ChangeNumberIndexDBCursor, CnIndexRecord};
pub use cn_indexer::ChangeNumberIndexer;
pub use config::{ChangelogConfig, Config};
pub use csn::Csn;
pub use csn_generator::{Clock, CsnGenerator, ManualClock, SystemClock};
pub use cursor::{CursorOptions, DBCursor, KeyMatchingStrategy, PositionStrategy};
pub use domain_db::{DomainDBCursor, MultiDomainDBCursor, ReplicationDomainDB};
pub use error::{ChangelogError, CookieError, DecodeError, Result};
pub use multi_domain_state::MultiDomainServerState;
pub use replica_db::{ReplicaCursor, ReplicaDB, ReplicaDBStatus};
pub use server_state::ServerState;
pub use service::{ChangelogService, DomainStatus, ReplicaStatus, ServiceHandle};
pub use storage::{KeyValueStore, MemoryStorage, SqliteStorage};
pub use update_msg::UpdateMsg;
