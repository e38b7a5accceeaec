use thiserror::Error;

/// Storage level failure of the changelog
///
/// Surfaced to callers as-is: nothing in the indexing or merge layers
/// retries on its own.
#[derive(Debug, Error)]
pub enum ChangelogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("record encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record in {tree} at key {key}: {reason}")]
    CorruptRecord {
        tree: String,
        key: String,
        reason: String,
    },

    #[error("replica db {0} is closed")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, ChangelogError>;

/// Malformed CSN or cookie input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid CSN length: {0}")]
    InvalidCsnLength(usize),

    #[error("invalid CSN: {0}")]
    InvalidCsnHex(String),

    #[error("invalid cookie {cookie:?}: {reason}")]
    InvalidCookie { cookie: String, reason: String },
}

/// Reasons a consumer supplied cookie cannot be used to resume
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CookieError {
    #[error("cookie references unknown domains {unknown:?}, current cookie is {current}")]
    UnknownDomains {
        unknown: Vec<String>,
        current: String,
    },

    #[error("cookie is too old for domain {0}, changes have been purged")]
    Outdated(String),
}
