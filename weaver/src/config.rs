use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

/// Nanoseconds per second.
pub const NANO: u64 = 1_000_000_000;

const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";

/// Cluster-wide constants, loaded once at process start from weaver.yaml.
///
/// The counts (`num_vts`, `num_shards`, `shard_id_incr`) are required; the
/// tunables are optional in the file and fall back through accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaverConfig {
    /// Number of vector timestampers. Also the clock width (ClkSz).
    pub num_vts: u64,

    /// Number of graph shards.
    pub num_shards: u64,

    /// First shard endpoint id; shard i lives at `shard_id_incr + i`.
    pub shard_id_incr: u64,

    /// Worker threads per VT process. Default 8.
    num_vt_threads: Option<usize>,

    /// Period of the no-op worker, nanoseconds. Default 10ms.
    vt_timeout_nano: Option<u64>,

    /// Period of the clock-gossip worker, nanoseconds. Default 1ms.
    vt_clk_timeout_nano: Option<u64>,

    server_manager_ipaddr: Option<String>,

    server_manager_port: Option<u16>,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        WeaverConfig {
            num_vts: 1,
            num_shards: 1,
            shard_id_incr: 1,
            num_vt_threads: Some(8),
            vt_timeout_nano: Some(10_000_000),
            vt_clk_timeout_nano: Some(1_000_000),
            server_manager_ipaddr: Some(DEFAULT_LISTEN_HOST.to_string()),
            server_manager_port: Some(2002),
        }
    }
}

impl WeaverConfig {
    /// A configuration with the given cluster shape and default tunables.
    pub fn for_cluster(num_vts: u64, num_shards: u64, shard_id_incr: u64) -> Self {
        WeaverConfig { num_vts, num_shards, shard_id_incr, ..WeaverConfig::default() }
    }

    /// Reads the configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> CResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: WeaverConfig = serde_yaml::from_str(&raw)?;
        Ok(cfg)
    }

    /// Clock width; one counter per VT.
    pub fn clk_sz(&self) -> usize {
        self.num_vts as usize
    }

    pub fn get_num_vt_threads(&self) -> usize {
        self.num_vt_threads.unwrap_or(8)
    }

    pub fn get_vt_timeout_nano(&self) -> u64 {
        self.vt_timeout_nano.unwrap_or(10_000_000)
    }

    pub fn get_vt_clk_timeout_nano(&self) -> u64 {
        self.vt_clk_timeout_nano.unwrap_or(1_000_000)
    }

    pub fn get_server_manager_ipaddr(&self) -> String {
        self.server_manager_ipaddr
            .clone()
            .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string())
    }

    pub fn get_server_manager_port(&self) -> u16 {
        self.server_manager_port.unwrap_or(2002)
    }

    /// Shard endpoint id for shard index `idx` (0-based).
    pub fn shard_endpoint(&self, idx: u64) -> u64 {
        self.shard_id_incr + idx
    }

    /// Inverse of [`shard_endpoint`](Self::shard_endpoint).
    pub fn shard_index(&self, endpoint: u64) -> Option<u64> {
        if endpoint < self.shard_id_incr {
            return None;
        }
        let idx = endpoint - self.shard_id_incr;
        if idx < self.num_shards {
            Some(idx)
        } else {
            None
        }
    }
}
