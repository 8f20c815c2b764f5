//! Loading and saving [`PersistedSchedulerState`] (§6) at
//! [`cnode_buildcfg::SCHEDULER_STATE_FN`]. Reloaded verbatim at startup
//! so a restarted scheduler doesn't reset every pool's integral-guarantee
//! accumulator to zero and doesn't forget which scheduling segment each
//! node last reported.

use std::path::Path;

use cnode_api_types::persisted_state::{NodeSchedulingSegmentState, PersistedSchedulerState, PoolPersistedState};
use cnode_api_types::NodeId;

use crate::tree::Tree;

/// Reads the persisted state file, if present, and applies it to a
/// freshly built tree. Pools named in the file that no longer exist in
/// the current configuration are dropped with a warning rather than
/// treated as an error — configs are allowed to remove pools.
pub fn apply(tree: &mut Tree, state: &PersistedSchedulerState) {
    for (pool_id, pool_state) in &state.pool_states {
        match tree.pool_index.get(pool_id) {
            Some(&index) => {
                tree.elements[index].accumulated_resource_volume = pool_state.accumulated_resource_volume;
            }
            None => {
                log::warn!("persisted scheduler state references unknown pool {pool_id}, dropping");
            }
        }
    }
}

/// Extracts the bits of a tree worth persisting (§6): every pool's
/// accumulated integral-guarantee volume. Scheduling segment state is
/// supplied separately by the caller, since it comes from node heartbeat
/// bookkeeping rather than the tree itself.
pub fn snapshot(tree: &Tree, scheduling_segments: std::collections::HashMap<NodeId, NodeSchedulingSegmentState>) -> PersistedSchedulerState {
    let mut pool_states = std::collections::HashMap::new();
    for (pool_id, &index) in &tree.pool_index {
        pool_states.insert(
            pool_id.clone(),
            PoolPersistedState {
                accumulated_resource_volume: tree.elements[index].accumulated_resource_volume,
            },
        );
    }
    PersistedSchedulerState {
        pool_states,
        scheduling_segments_state: scheduling_segments,
    }
}

pub fn load(path: &Path) -> anyhow::Result<Option<PersistedSchedulerState>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn save(path: &Path, state: &PersistedSchedulerState) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(state)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn default_path() -> &'static Path {
    Path::new(cnode_buildcfg::SCHEDULER_STATE_FN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, PoolsConfig};
    use crate::tree::SchedulerTree;
    use cnode_api_types::{PoolId, ResourceVector};

    fn pool(id: &str) -> PoolConfig {
        PoolConfig {
            id: PoolId(id.to_owned()),
            parent: None,
            weight: 1.0,
            strong_guarantee: ResourceVector::ZERO,
            resource_limits: None,
            max_share_ratio: None,
            burst_ratio: 0.0,
            flow_ratio: 1.0,
            scheduling_tag_filter: Default::default(),
            allow_regular_preemption: true,
            allow_aggressive_preemption: false,
            max_running_operation_count: None,
            max_operation_count: None,
        }
    }

    #[test]
    fn apply_restores_known_pool_and_ignores_unknown() {
        let cfg = PoolsConfig { pools: vec![pool("a")] };
        let scheduler = SchedulerTree::from_config(&cfg).unwrap();
        let mut tree = (*scheduler.snapshot()).clone();

        let mut state = PersistedSchedulerState::default();
        state.pool_states.insert(PoolId("a".to_owned()), PoolPersistedState { accumulated_resource_volume: 42.0 });
        state.pool_states.insert(PoolId("ghost".to_owned()), PoolPersistedState { accumulated_resource_volume: 1.0 });

        apply(&mut tree, &state);
        assert_eq!(tree.pool(&PoolId("a".to_owned())).unwrap().accumulated_resource_volume, 42.0);
    }

    #[test]
    fn round_trips_through_json_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler-state.json");

        let mut state = PersistedSchedulerState::default();
        state.pool_states.insert(PoolId("a".to_owned()), PoolPersistedState { accumulated_resource_volume: 7.5 });

        save(&path, &state).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.pool_states[&PoolId("a".to_owned())].accumulated_resource_volume, 7.5);
    }

    #[test]
    fn load_returns_none_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(load(&path).unwrap().is_none());
    }
}
