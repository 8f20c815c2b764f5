//! Scheduler process: builds the fair-share tree from its pools config,
//! restores persisted pool state, then ticks the fair-share update on a
//! fixed interval until asked to stop, saving state back to disk after
//! every tick.
//!
//! No RPC transport is wired in here — nothing in this workspace opens a
//! socket, so node heartbeats never actually reach
//! `scheduler_core::heartbeat::run` in this binary. Whatever replaces the
//! `ArtifactSource`/`ReplicaTarget` seams in the data-node binary would
//! pair here with a heartbeat handler that calls `scheduler.snapshot()`,
//! runs `scheduler_core::heartbeat::run` against it, and reports the
//! `ScheduleOutcome` back over the wire; this process just keeps the tree
//! itself current in the meantime.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};

use cluster_node::config::{self, SchedulerConfig};
use scheduler_tree::SchedulerTree;

#[tokio::main]
async fn main() -> Result<()> {
    cluster_node::logging::init("info");

    let config_path = config::default_scheduler_config_path();
    let config: SchedulerConfig = config::load(&config_path)?;
    log::info!("starting scheduler with {} pool(s)", config.pools.pools.len());

    let scheduler = SchedulerTree::from_config(&config.pools).context("building fair-share tree from config")?;

    let state_path = scheduler_tree::persisted_state::default_path();
    if let Some(persisted) = scheduler_tree::persisted_state::load(state_path).context("loading persisted scheduler state")? {
        scheduler.restore_persisted_state(&persisted);
        log::info!("restored {} pool(s) of persisted integral-guarantee state", persisted.pool_states.len());
    }

    let interval = Duration::from_secs(config.update_interval_secs);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                scheduler.update(config.total_resources);
                let tree = scheduler.snapshot();
                let segments: HashMap<cnode_api_types::NodeId, cnode_api_types::persisted_state::NodeSchedulingSegmentState> = HashMap::new();
                let persisted = scheduler_tree::persisted_state::snapshot(&tree, segments);
                if let Err(err) = scheduler_tree::persisted_state::save(state_path, &persisted) {
                    log::warn!("failed to persist scheduler state: {err:#}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}
