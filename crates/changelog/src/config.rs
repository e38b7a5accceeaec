use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub changelog: ChangelogConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server id used in the CSNs issued by this replica
    pub server_id: u16,
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogConfig {
    /// Changes older than this are trimmed from replica logs
    #[serde(default = "default_purge_delay_ms")]
    pub purge_delay_ms: u64,
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
    /// Replicas silent for longer than this are reported as stale
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Assign change numbers to changes as they become visible
    #[serde(default = "default_true")]
    pub change_number_indexing: bool,
    /// Domains never exposed through change numbers
    #[serde(default)]
    pub excluded_domains: Vec<String>,
    /// Pending publish notifications before publishers are suspended
    #[serde(default = "default_index_queue_size")]
    pub index_queue_size: usize,
    #[serde(default = "default_index_interval_ms")]
    pub index_interval_ms: u64,
}

fn default_purge_delay_ms() -> u64 {
    3 * 24 * 60 * 60 * 1000
}

fn default_purge_interval_ms() -> u64 {
    60_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_index_queue_size() -> usize {
    1024
}

fn default_index_interval_ms() -> u64 {
    1_000
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            purge_delay_ms: default_purge_delay_ms(),
            purge_interval_ms: default_purge_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            change_number_indexing: true,
            excluded_domains: Vec::new(),
            index_queue_size: default_index_queue_size(),
            index_interval_ms: default_index_interval_ms(),
        }
    }
}

impl ChangelogConfig {
    pub fn purge_delay(&self) -> Duration {
        Duration::from_millis(self.purge_delay_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn index_interval(&self) -> Duration {
        Duration::from_millis(self.index_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub sqlite_cache_size: i32,
    pub sqlite_busy_timeout: i32,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_pool_size() -> u32 {
    5
}

impl Config {
    /// Load from a TOML file, `CHANGELOG__SECTION__KEY` variables override it
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CHANGELOG").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_from_file_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
server_id = 3
db_path = "data/changelog.db"

[changelog]
purge_delay_ms = 1000
excluded_domains = ["cn=admin data"]

[storage]
sqlite_cache_size = 1000
sqlite_busy_timeout = 5000
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.server_id, 3);
        assert_eq!(config.changelog.purge_delay(), Duration::from_secs(1));
        assert_eq!(config.changelog.excluded_domains, vec!["cn=admin data"]);
        assert!(config.changelog.change_number_indexing);
        assert_eq!(config.changelog.index_queue_size, 1024);
        assert_eq!(config.storage.pool_size, 5);
    }
}
