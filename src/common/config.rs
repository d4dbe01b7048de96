//! Configuration for a lockstep node

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration
///
/// A node's own endpoint is `members[server_id - 1]`; `server_id` is
/// 1-based so that config files can share one member list cluster-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster members as `host:port`, identical on every node
    pub members: Vec<String>,

    /// 1-based index of this node inside `members`
    pub server_id: usize,

    /// Directory for meta files and the data store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for the binlog
    #[serde(default = "default_binlog_dir")]
    pub binlog_dir: PathBuf,

    /// Upper bound on cluster size
    #[serde(default = "default_max_cluster_size")]
    pub max_cluster_size: usize,

    /// Max entries per replication batch
    #[serde(default = "default_log_rep_batch_max")]
    pub log_rep_batch_max: usize,

    /// Sleep between replication retries (ms)
    #[serde(default = "default_replication_retry_timespan")]
    pub replication_retry_timespan_ms: u64,

    /// Election timeout lower bound (ms)
    #[serde(default = "default_elect_timeout_min")]
    pub elect_timeout_min_ms: u64,

    /// Election timeout upper bound (ms, exclusive)
    #[serde(default = "default_elect_timeout_max")]
    pub elect_timeout_max_ms: u64,

    /// Session lease length (µs)
    #[serde(default = "default_session_expire_timeout")]
    pub session_expire_timeout_us: i64,

    /// Binlog garbage-collection period (s)
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Max client writes awaiting commit before rejecting with Busy
    #[serde(default = "default_max_write_pending")]
    pub max_write_pending: usize,

    /// Max committed-but-unapplied entries a follower accepts
    #[serde(default = "default_max_commit_pending")]
    pub max_commit_pending: i64,

    /// Compress binlog blocks
    #[serde(default)]
    pub binlog_compress: bool,

    /// Binlog block size (KB)
    #[serde(default = "default_binlog_block_size")]
    pub binlog_block_size_kb: usize,

    /// Binlog write buffer (MB)
    #[serde(default = "default_binlog_write_buffer")]
    pub binlog_write_buffer_mb: usize,

    /// Compress data-store blocks
    #[serde(default)]
    pub data_compress: bool,

    /// Data-store block size (KB)
    #[serde(default = "default_data_block_size")]
    pub data_block_size_kb: usize,

    /// Data-store write buffer (MB)
    #[serde(default = "default_data_write_buffer")]
    pub data_write_buffer_mb: usize,

    /// Width of the per-operation stat ring, in one-second buckets
    #[serde(default = "default_performance_buffer_size")]
    pub performance_buffer_size: usize,

    /// Emit one access-log line per this many calls of each operation
    #[serde(default = "default_trace_ratio")]
    pub trace_ratio: u64,

    /// Inbound throughput cap (MB/s, -1 = unlimited)
    #[serde(default = "default_max_throughput")]
    pub max_throughput_in: i64,

    /// Outbound throughput cap (MB/s, -1 = unlimited)
    #[serde(default = "default_max_throughput")]
    pub max_throughput_out: i64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_binlog_dir() -> PathBuf {
    PathBuf::from("./binlog")
}
fn default_max_cluster_size() -> usize {
    10
}
fn default_log_rep_batch_max() -> usize {
    500
}
fn default_replication_retry_timespan() -> u64 {
    900
}
fn default_elect_timeout_min() -> u64 {
    150
}
fn default_elect_timeout_max() -> u64 {
    300
}
fn default_session_expire_timeout() -> i64 {
    6_000_000
}
fn default_gc_interval() -> u64 {
    60
}
fn default_max_write_pending() -> usize {
    10_000
}
fn default_max_commit_pending() -> i64 {
    10_000
}
fn default_binlog_block_size() -> usize {
    32
}
fn default_binlog_write_buffer() -> usize {
    32
}
fn default_data_block_size() -> usize {
    32
}
fn default_data_write_buffer() -> usize {
    32
}
fn default_performance_buffer_size() -> usize {
    60
}
fn default_trace_ratio() -> u64 {
    100
}
fn default_max_throughput() -> i64 {
    -1
}

impl Config {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.members.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "members must not be empty".into(),
            ));
        }
        if self.server_id < 1 || self.server_id > self.members.len() {
            return Err(crate::Error::InvalidConfig(format!(
                "bad server_id: {} (cluster has {} members)",
                self.server_id,
                self.members.len()
            )));
        }
        if self.members.len() > self.max_cluster_size {
            return Err(crate::Error::InvalidConfig(format!(
                "cluster size {} exceeds max_cluster_size {}",
                self.members.len(),
                self.max_cluster_size
            )));
        }
        if self.elect_timeout_min_ms >= self.elect_timeout_max_ms {
            return Err(crate::Error::InvalidConfig(
                "elect_timeout_min_ms must be below elect_timeout_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// This node's own endpoint
    pub fn self_endpoint(&self) -> &str {
        &self.members[self.server_id - 1]
    }

    /// All members except this node
    pub fn peers(&self) -> Vec<String> {
        let me = self.self_endpoint().to_string();
        self.members.iter().filter(|m| **m != me).cloned().collect()
    }

    /// Is the cluster a single node?
    pub fn single_node(&self) -> bool {
        self.members.len() == 1
    }

    /// Session lease as a Duration
    pub fn session_expire_timeout(&self) -> Duration {
        Duration::from_micros(self.session_expire_timeout_us.max(0) as u64)
    }

    /// Sleep between replication retries
    pub fn replication_retry_timespan(&self) -> Duration {
        Duration::from_millis(self.replication_retry_timespan_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            members: vec!["127.0.0.1:8868".to_string()],
            server_id: 1,
            data_dir: default_data_dir(),
            binlog_dir: default_binlog_dir(),
            max_cluster_size: default_max_cluster_size(),
            log_rep_batch_max: default_log_rep_batch_max(),
            replication_retry_timespan_ms: default_replication_retry_timespan(),
            elect_timeout_min_ms: default_elect_timeout_min(),
            elect_timeout_max_ms: default_elect_timeout_max(),
            session_expire_timeout_us: default_session_expire_timeout(),
            gc_interval_secs: default_gc_interval(),
            max_write_pending: default_max_write_pending(),
            max_commit_pending: default_max_commit_pending(),
            binlog_compress: false,
            binlog_block_size_kb: default_binlog_block_size(),
            binlog_write_buffer_mb: default_binlog_write_buffer(),
            data_compress: false,
            data_block_size_kb: default_data_block_size(),
            data_write_buffer_mb: default_data_write_buffer(),
            performance_buffer_size: default_performance_buffer_size(),
            trace_ratio: default_trace_ratio(),
            max_throughput_in: default_max_throughput(),
            max_throughput_out: default_max_throughput(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_config() -> Config {
        Config {
            members: vec![
                "127.0.0.1:8868".to_string(),
                "127.0.0.1:8869".to_string(),
                "127.0.0.1:8870".to_string(),
            ],
            server_id: 2,
            ..Config::default()
        }
    }

    #[test]
    fn test_self_endpoint_and_peers() {
        let config = three_node_config();
        assert_eq!(config.self_endpoint(), "127.0.0.1:8869");
        assert_eq!(
            config.peers(),
            vec!["127.0.0.1:8868".to_string(), "127.0.0.1:8870".to_string()]
        );
        assert!(!config.single_node());
    }

    #[test]
    fn test_validate() {
        assert!(three_node_config().validate().is_ok());

        let mut bad_id = three_node_config();
        bad_id.server_id = 4;
        assert!(bad_id.validate().is_err());

        let mut no_members = three_node_config();
        no_members.members.clear();
        assert!(no_members.validate().is_err());

        let mut bad_timeout = three_node_config();
        bad_timeout.elect_timeout_max_ms = bad_timeout.elect_timeout_min_ms;
        assert!(bad_timeout.validate().is_err());
    }
}
