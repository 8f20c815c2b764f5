//! Data-node process: brings up every configured location, rebuilds the
//! chunk registry and artifact cache from what's already on disk, then
//! runs the lease sweeper until asked to stop.
//!
//! No RPC transport is wired in here — nothing in this workspace opens a
//! socket (`cnode_store::session::ReplicaTarget` is the seam a real
//! replication transport would implement; `ArtifactSource` below is the
//! matching seam for artifact downloads). This binary is the process
//! shell a transport would be embedded into.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use cluster_node::config::{self, NodeConfig};
use cnode_api_types::{ChunkId, ClusterError};
use cnode_io::{Location, Throttler};
use cnode_store::artifact_key::ChunkSpec;
use cnode_store::{ArtifactCache, ArtifactFormat, ArtifactSource, BlockCache, ChunkRegistry, DedupOutcome, MemoryTracker, SessionManager};

/// Stands in for a live peer transport: every download simply fails.
/// Whatever replaces this will satisfy `ArtifactSource` and get handed to
/// `ArtifactCache::new` in its place, no other wiring here changes.
struct NoTransport;

#[async_trait::async_trait]
impl ArtifactSource for NoTransport {
    async fn read_chunk(&self, _chunk_id: ChunkId) -> Result<Arc<[u8]>, ClusterError> {
        Err(ClusterError::IoError("no peer transport configured".into()))
    }

    async fn stream_file(&self, _chunk_specs: &[ChunkSpec]) -> Result<Vec<u8>, ClusterError> {
        Err(ClusterError::IoError("no peer transport configured".into()))
    }

    async fn stream_table(
        &self,
        _chunk_specs: &[ChunkSpec],
        _schema: Option<&str>,
        _column_filter: Option<&[String]>,
        _format: ArtifactFormat,
    ) -> Result<Vec<u8>, ClusterError> {
        Err(ClusterError::IoError("no peer transport configured".into()))
    }
}

fn bring_up_locations(config: &NodeConfig, registry: &ChunkRegistry) -> Result<Vec<Arc<Location>>> {
    let mut locations = Vec::with_capacity(config.locations.len());
    for (index, location_config) in config.locations.iter().enumerate() {
        let name: &'static str = Box::leak(format!("location-{index}").into_boxed_str());
        let location = Arc::new(Location::new(location_config.clone(), name));
        let found = location
            .initialize()
            .with_context(|| format!("initializing location {}", location.path().display()))?;

        log::info!("location {} found {} existing chunk(s) on disk", location.path().display(), found.len());
        for descriptor in found {
            let candidate = cnode_store::CandidateChunk {
                id: descriptor.chunk_id,
                location: location.clone(),
                disk_space: descriptor.disk_space,
                inode: descriptor.inode,
                modified: descriptor.modified,
                row_count: None,
            };
            match registry.register_existing_chunk(candidate)? {
                DedupOutcome::Registered => {}
                DedupOutcome::DiscardCandidate => {
                    log::warn!("chunk {} already registered from another location, discarding this copy", descriptor.chunk_id);
                }
                DedupOutcome::ReplacedExisting(previous) => {
                    log::warn!("chunk {} replaced a stale registration at {}", descriptor.chunk_id, previous.location.path().display());
                }
            }
        }

        locations.push(location);
    }
    Ok(locations)
}

#[tokio::main]
async fn main() -> Result<()> {
    cluster_node::logging::init("info");

    let config_path = config::default_node_config_path();
    let config: NodeConfig = config::load(&config_path)?;
    log::info!("starting data-node {} with {} location(s)", config.node_id, config.locations.len());

    let registry = Arc::new(ChunkRegistry::unbounded());
    let locations = bring_up_locations(&config, &registry)?;

    let node_throttler = Arc::new(match config.node_io_rate_limit {
        Some(rate) => Throttler::new(rate, rate),
        None => Throttler::unlimited(),
    });

    let artifact_cache = ArtifactCache::new(
        config.artifact_cache_bytes,
        locations.clone(),
        node_throttler.clone(),
        Arc::new(NoTransport),
    );
    artifact_cache.validate_on_startup().await.context("validating artifact cache on startup")?;

    let _block_cache = BlockCache::new(config.block_cache_bytes);
    let memory_tracker = MemoryTracker::new(config.session_memory_limit_bytes);

    let session_manager = SessionManager::new(
        config.max_concurrent_sessions,
        Duration::from_secs(config.session_timeout_secs),
        registry.clone(),
        memory_tracker,
        node_throttler,
    );

    let sweeper = {
        let session_manager = session_manager.clone();
        let interval = Duration::from_secs(config.lease_sweep_interval_secs);
        tokio::spawn(async move { session_manager.run_lease_sweeper(interval).await })
    };

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    log::info!("shutdown requested, draining sessions");
    session_manager.shutdown();
    sweeper.abort();

    Ok(())
}
