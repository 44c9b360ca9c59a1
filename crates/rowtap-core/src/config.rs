//! Application configuration.
//!
//! One immutable [`AppConfig`] is loaded from YAML at daemon start and
//! passed by reference to every worker. All knobs have defaults so a
//! minimal config file only names what differs from them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a brand-new consumer starts reading a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    /// Only messages produced after consumer creation.
    #[default]
    Newest,
    /// Everything retained in the topic.
    Oldest,
}

/// Address of the MySQL database holding the state catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDbConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_state_db_name")]
    pub db: String,
}

impl Default for StateDbConfig {
    fn default() -> Self {
        StateDbConfig {
            host: default_host(),
            port: default_mysql_port(),
            user: default_user(),
            password: String::new(),
            db: default_state_db_name(),
        }
    }
}

/// Global pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Topic namespace prefix.
    pub namespace: String,
    /// State catalog database.
    pub state_db: StateDbConfig,
    /// Kafka bootstrap brokers.
    pub kafka_addrs: Vec<String>,
    /// Base directory for file-backed topics.
    pub data_dir: PathBuf,
    /// File pipe segment rotation threshold, bytes of data per segment.
    pub max_file_size: u64,
    /// Pipe kind backing the changelog buffer: `kafka`, `file` or `local`.
    pub changelog_pipe_type: String,
    /// Envelope encoding between reader and streamer: `json` or `msgpack`.
    pub internal_encoding: String,
    /// Streamer worker count per process.
    pub max_num_procs: usize,
    /// Messages accumulated before a batched pipe push.
    pub pipe_batch_size: usize,
    /// Seconds between persisted `{gtid, seqno}` checkpoints.
    pub state_update_timeout_secs: u64,
    /// Max concurrent streamers per `(service, cluster)`; 0 = unlimited.
    pub cluster_concurrency: usize,
    /// Whether streamers tail the changelog buffer after bootstrap.
    pub changelog_buffer: bool,
    /// Snapshot read throttle, megabytes per second; 0 disables.
    pub throttle_target_mb: u64,
    /// Snapshot read throttle, rows per second; 0 disables.
    pub throttle_target_iops: u64,
    /// Starting position for new consumers.
    pub initial_offset: InitialOffset,
    /// Whether file-pipe messages are framed for consumption.
    pub delimited: bool,
    /// Replica server id announced to MySQL by the binlog reader.
    pub server_id: u32,
    /// Restrict this instance to one source cluster.
    pub cluster_filter: Option<String>,
    /// Output topic template; `{ns}`, `{svc}`, `{db}`, `{table}` expand.
    pub output_topic_format: String,
    /// Changelog topic template; same placeholders.
    pub changelog_topic_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            namespace: "rowtap".into(),
            state_db: StateDbConfig::default(),
            kafka_addrs: vec!["localhost:9092".into()],
            data_dir: PathBuf::from("/var/lib/rowtap"),
            max_file_size: 1 << 30,
            changelog_pipe_type: "kafka".into(),
            internal_encoding: "json".into(),
            max_num_procs: 3,
            pipe_batch_size: 256,
            state_update_timeout_secs: 300,
            cluster_concurrency: 0,
            changelog_buffer: true,
            throttle_target_mb: 0,
            throttle_target_iops: 0,
            initial_offset: InitialOffset::Newest,
            delimited: true,
            server_id: 429496,
            cluster_filter: None,
            output_topic_format: "{ns}-{svc}-{db}-{table}".into(),
            changelog_topic_format: "{ns}-tap-{svc}-{db}-{table}".into(),
        }
    }
}

/// Errors from loading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AppConfig {
    /// Load a config file, applying defaults for anything unset.
    pub fn load(path: &std::path::Path) -> Result<AppConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Name of the externally visible topic for a table.
    pub fn output_topic(&self, svc: &str, db: &str, table: &str) -> String {
        expand(&self.output_topic_format, &self.namespace, svc, db, table)
    }

    /// Name of the internal changelog buffer topic for a table.
    pub fn changelog_topic(&self, svc: &str, db: &str, table: &str) -> String {
        expand(&self.changelog_topic_format, &self.namespace, svc, db, table)
    }
}

fn expand(template: &str, ns: &str, svc: &str, db: &str, table: &str) -> String {
    template
        .replace("{ns}", ns)
        .replace("{svc}", svc)
        .replace("{db}", db)
        .replace("{table}", table)
}

fn default_host() -> String {
    "localhost".into()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_user() -> String {
    "root".into()
}

fn default_state_db_name() -> String {
    "rowtap".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.max_num_procs, 3);
        assert_eq!(cfg.internal_encoding, "json");
        assert!(cfg.delimited);
        assert_eq!(cfg.initial_offset, InitialOffset::Newest);
    }

    #[test]
    fn topic_names() {
        let cfg = AppConfig { namespace: "hp".into(), ..AppConfig::default() };
        assert_eq!(cfg.changelog_topic("svc1", "db1", "t1"), "hp-tap-svc1-db1-t1");
        assert_eq!(cfg.output_topic("svc1", "db1", "t1"), "hp-svc1-db1-t1");
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: AppConfig = serde_yaml::from_str(
            "namespace: hp\nmax_file_size: 1\ninitial_offset: oldest\n",
        )
        .unwrap();
        assert_eq!(cfg.namespace, "hp");
        assert_eq!(cfg.max_file_size, 1);
        assert_eq!(cfg.initial_offset, InitialOffset::Oldest);
        assert_eq!(cfg.pipe_batch_size, 256);
    }
}
