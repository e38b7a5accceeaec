use crate::config::StorageConfig;
use crate::error::Result;
use crate::storage::{KeyValueStore, KeyValues, ScanOrder};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use std::ops::Bound;
use std::path::Path;
use tracing::debug;

type DbPool = Pool<SqliteConnectionManager>;

/// SQLite implementation of the KeyValueStore trait
///
/// All trees share one `kv` table keyed by `(tree, key)`; SQLite compares
/// BLOBs with memcmp so range scans follow raw byte order.
pub struct SqliteStorage {
    pool: DbPool,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self> {
        let cache_size = config.sqlite_cache_size;
        let busy_timeout = config.sqlite_busy_timeout;
        let path_ref = path.as_ref();

        // Initialize schema with a single connection first
        {
            let conn = Connection::open(path_ref)?;
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            Self::create_schema(&conn)?;
        }

        // Now create the pool - schema already exists
        let manager = SqliteConnectionManager::file(path_ref).with_init(move |conn| {
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .min_idle(Some(1))
            .build(manager)?;

        debug!("Opened changelog store at {:?}", path_ref);
        Ok(SqliteStorage { pool })
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- every tree (replica log, change number index, metadata)
            CREATE TABLE IF NOT EXISTS kv (
                tree TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (tree, key)
            ) WITHOUT ROWID;
            "#,
        )?;

        Ok(())
    }
}

/// Append the SQL conditions for a key range, pushing their parameters
fn range_clause(lower: Bound<&[u8]>, upper: Bound<&[u8]>, params: &mut Vec<Value>) -> String {
    let mut sql = String::new();
    match lower {
        Bound::Included(key) => {
            sql.push_str(" AND key >= ?");
            params.push(Value::Blob(key.to_vec()));
        }
        Bound::Excluded(key) => {
            sql.push_str(" AND key > ?");
            params.push(Value::Blob(key.to_vec()));
        }
        Bound::Unbounded => {}
    }
    match upper {
        Bound::Included(key) => {
            sql.push_str(" AND key <= ?");
            params.push(Value::Blob(key.to_vec()));
        }
        Bound::Excluded(key) => {
            sql.push_str(" AND key < ?");
            params.push(Value::Blob(key.to_vec()));
        }
        Bound::Unbounded => {}
    }
    sql
}

impl KeyValueStore for SqliteStorage {
    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE tree = ?1 AND key = ?2",
                rusqlite::params![tree, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, tree: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO kv (tree, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT (tree, key) DO UPDATE SET value = excluded.value
            "#,
            rusqlite::params![tree, key, value],
        )?;
        Ok(())
    }

    fn delete(&self, tree: &str, key: &[u8]) -> Result<bool> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM kv WHERE tree = ?1 AND key = ?2",
            rusqlite::params![tree, key],
        )?;
        Ok(removed > 0)
    }

    fn delete_range(
        &self,
        tree: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<usize> {
        let mut params = vec![Value::Text(tree.to_string())];
        let sql = format!(
            "DELETE FROM kv WHERE tree = ?{}",
            range_clause(lower, upper, &mut params)
        );

        let conn = self.pool.get()?;
        let removed = conn.execute(&sql, rusqlite::params_from_iter(params))?;
        Ok(removed)
    }

    fn scan(
        &self,
        tree: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        order: ScanOrder,
        limit: usize,
    ) -> Result<KeyValues> {
        let mut params = vec![Value::Text(tree.to_string())];
        let range = range_clause(lower, upper, &mut params);
        let direction = match order {
            ScanOrder::Forward => "ASC",
            ScanOrder::Backward => "DESC",
        };
        params.push(Value::Integer(limit.min(i64::MAX as usize) as i64));
        let sql = format!(
            "SELECT key, value FROM kv WHERE tree = ?{} ORDER BY key {} LIMIT ?",
            range, direction
        );

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn drop_tree(&self, tree: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM kv WHERE tree = ?1", [tree])?;
        Ok(())
    }

    fn list_trees(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT DISTINCT tree FROM kv ORDER BY tree")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(Into::into)
    }
}
