//! Node and scheduler configuration loading.
//!
//! The teacher keeps configuration as `section_config`-parsed `.conf`
//! files; nothing in the retrieval pack models a YAML/TOML loader for a
//! single-document config, so this follows the simpler pattern
//! `cnode_api_types::persisted_state` already uses for on-disk state:
//! plain `serde`-derived structs read with `serde_json`. Swapping in a
//! section-config-style format later is a parser change only, not a
//! schema change.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use cnode_api_types::scheduling::SchedulingSegment;
use cnode_api_types::{NodeId, ResourceVector};
use cnode_io::LocationConfig;

fn default_scheduling_segment() -> SchedulingSegment {
    SchedulingSegment::default_segment()
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_lease_sweep_interval_secs() -> u64 {
    30
}

fn default_node_memory_limit_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_artifact_cache_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_block_cache_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_concurrent_sessions() -> usize {
    256
}

/// Everything the `data-node` binary needs to bring up the chunk
/// lifecycle (§4.1–§4.6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub locations: Vec<LocationConfig>,
    #[serde(default)]
    pub node_io_rate_limit: Option<u64>,
    #[serde(default = "default_node_memory_limit_bytes")]
    pub session_memory_limit_bytes: u64,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_lease_sweep_interval_secs")]
    pub lease_sweep_interval_secs: u64,
    #[serde(default = "default_artifact_cache_bytes")]
    pub artifact_cache_bytes: u64,
    #[serde(default = "default_block_cache_bytes")]
    pub block_cache_bytes: u64,
}

fn default_pool_update_interval_secs() -> u64 {
    5
}

/// Everything the `scheduler` binary needs to build and tick the
/// fair-share tree (§4.7–§4.9).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub pools: scheduler_tree::PoolsConfig,
    pub total_resources: ResourceVector,
    #[serde(default = "default_scheduling_segment")]
    pub segment: SchedulingSegment,
    #[serde(default = "default_pool_update_interval_secs")]
    pub update_interval_secs: u64,
}

pub fn load<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing config {}", path.display()))
}

pub fn default_node_config_path() -> PathBuf {
    PathBuf::from(cnode_buildcfg::configdir!("/node.json"))
}

pub fn default_scheduler_config_path() -> PathBuf {
    PathBuf::from(cnode_buildcfg::configdir!("/scheduler.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_round_trips_with_defaults_filled_in() {
        let json = serde_json::json!({
            "node_id": "node-1",
            "locations": [],
        });
        let config: NodeConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.max_concurrent_sessions, default_max_concurrent_sessions());
        assert_eq!(config.session_timeout_secs, default_session_timeout_secs());
    }
}
