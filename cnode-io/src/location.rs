//! A single storage location: a mount point holding chunks for one medium
//! class, together with its disk-space accounting, pending-IO counters and
//! sticky disable state (§3 "Location", §4.1).
//!
//! Grounded on `pbs_datastore::chunk_store::ChunkStore` for the on-disk
//! layout (`create()`, `chunk_path()`, sharded subdirectories) and on
//! `src/tools/disks` for free-space sampling, reimplemented here with
//! `nix::sys::statvfs` directly rather than through the teacher's
//! higher-level disk-management module, which also covers SMART/ZFS
//! reporting this workspace has no use for.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Error};

use cnode_api_types::ChunkId;

use crate::config::LocationConfig;
use crate::invoker::Invoker;
use crate::pending_io::{Direction, PendingIoCounters, PendingIoGuard, Workload};
use crate::throttler::Throttler;

/// A chunk discovered on disk during [`Location::initialize`], handed back
/// to the chunk registry so it can rebuild its in-memory index (§4.2
/// `RegisterExistingChunk`).
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub chunk_id: ChunkId,
    pub disk_space: u64,
    /// Inode number of the chunk file, used by startup dedup to tell two
    /// paths aliasing the same file apart from genuine replicas (§4.2).
    pub inode: u64,
    pub modified: SystemTime,
}

/// Why a location stopped accepting new work. Once set it is never
/// cleared; a disabled location is retired, not retried in-process (§4.1:
/// "disablement is sticky for the lifetime of the process").
#[derive(Debug, Clone)]
pub struct DisableReason(pub String);

pub struct Location {
    config: LocationConfig,
    counters: Arc<PendingIoCounters>,
    used_space_bytes: AtomicU64,
    chunk_count: AtomicI64,
    active_sessions: AtomicI64,
    disabled: std::sync::Mutex<Option<DisableReason>>,
    fatal: AtomicBool,
    write_invoker: Invoker,
    throttler: Throttler,
}

const SHARD_WIDTH: usize = 256;

impl Location {
    pub fn new(config: LocationConfig, name: &'static str) -> Self {
        let throttler = match config.io_rate_limit {
            Some(rate) => Throttler::new(rate, rate),
            None => Throttler::unlimited(),
        };
        Self {
            config,
            counters: Arc::new(PendingIoCounters::default()),
            used_space_bytes: AtomicU64::new(0),
            chunk_count: AtomicI64::new(0),
            active_sessions: AtomicI64::new(0),
            disabled: std::sync::Mutex::new(None),
            fatal: AtomicBool::new(false),
            write_invoker: Invoker::spawn(name),
            throttler,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn medium_name(&self) -> &str {
        &self.config.medium_name
    }

    pub fn write_invoker(&self) -> &Invoker {
        &self.write_invoker
    }

    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    pub fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        self.config
            .path
            .join("chunks")
            .join(id.shard_prefix())
            .join(id.to_string())
    }

    /// Creates the 256 shard subdirectories if this is a fresh location,
    /// then walks the tree reporting every chunk found so the registry can
    /// rebuild its index (§4.1 `Initialize`, §4.2 startup dedup).
    pub fn initialize(&self) -> Result<Vec<ChunkDescriptor>, Error> {
        let chunks_dir = self.config.path.join("chunks");
        std::fs::create_dir_all(&chunks_dir)
            .with_context(|| format!("creating {:?}", chunks_dir))?;

        for shard in 0..SHARD_WIDTH {
            let dir = chunks_dir.join(format!("{:02x}", shard));
            std::fs::create_dir_all(&dir).with_context(|| format!("creating shard dir {:?}", dir))?;
        }

        let mut found = Vec::new();
        let mut total_bytes: u64 = 0;
        for entry in walkdir::WalkDir::new(&chunks_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let chunk_id: ChunkId = match name.parse() {
                Ok(id) => id,
                Err(_) => continue,
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let disk_space = metadata.len();
            total_bytes += disk_space;
            found.push(ChunkDescriptor {
                chunk_id,
                disk_space,
                inode: metadata.ino(),
                modified: metadata.modified().unwrap_or(std::time::UNIX_EPOCH),
            });
        }

        self.used_space_bytes.store(total_bytes, Ordering::SeqCst);
        self.chunk_count.store(found.len() as i64, Ordering::SeqCst);

        Ok(found)
    }

    /// `HasEnoughSpace` (§4.1): samples free space on the underlying
    /// filesystem and compares it against the configured low watermark,
    /// refusing admission of `additional_bytes` if the location is
    /// disabled or would cross the watermark.
    pub fn has_enough_space(&self, additional_bytes: u64) -> bool {
        if self.is_disabled() {
            return false;
        }
        match statvfs_available_bytes(&self.config.path) {
            Ok(available) => available.saturating_sub(additional_bytes) > self.config.low_watermark_bytes,
            Err(_) => false,
        }
    }

    pub fn increase_pending_io(
        &self,
        direction: Direction,
        _workload: Workload,
        bytes: u64,
    ) -> PendingIoGuard {
        PendingIoGuard::new(self.counters.clone(), direction, bytes as i64)
    }

    pub fn pending_bytes(&self, direction: Direction) -> i64 {
        self.counters.pending_bytes(direction)
    }

    pub fn update_used_space(&self, delta_bytes: i64) {
        if delta_bytes >= 0 {
            self.used_space_bytes.fetch_add(delta_bytes as u64, Ordering::SeqCst);
        } else {
            self.used_space_bytes.fetch_sub((-delta_bytes) as u64, Ordering::SeqCst);
        }
    }

    pub fn used_space_bytes(&self) -> u64 {
        self.used_space_bytes.load(Ordering::SeqCst)
    }

    pub fn update_chunk_count(&self, delta: i64) {
        self.chunk_count.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn chunk_count(&self) -> i64 {
        self.chunk_count.load(Ordering::SeqCst)
    }

    /// Open write/read sessions against this location right now, used by
    /// `GetNewChunkLocation` (§4.2) to balance new sessions across the
    /// least-loaded enabled locations.
    pub fn active_session_count(&self) -> i64 {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub fn session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn session_finished(&self) {
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.lock().unwrap().is_some()
    }

    pub fn disable_reason(&self) -> Option<String> {
        self.disabled.lock().unwrap().as_ref().map(|r| r.0.clone())
    }

    /// Sticky disable (§4.1, §9 Open Question: a location disabled by a
    /// `ClusterError::fatal_to_location` error is never re-enabled for the
    /// lifetime of the process — recovery requires a restart after the
    /// underlying fault is fixed). The first call wins; later calls are
    /// no-ops so the original reason survives.
    pub fn disable(&self, reason: impl Into<String>) {
        let mut guard = self.disabled.lock().unwrap();
        if guard.is_none() {
            *guard = Some(DisableReason(reason.into()));
        }
    }

    pub fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::SeqCst);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }
}

fn statvfs_available_bytes(path: &Path) -> Result<u64, Error> {
    let stat = nix::sys::statvfs::statvfs(path).with_context(|| format!("statvfs {:?}", path))?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if available == 0 && stat.blocks_available() != 0 {
        bail!("fragment size reported as zero for {:?}", path);
    }
    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocationType;

    fn test_config(dir: &Path) -> LocationConfig {
        LocationConfig {
            path: dir.to_path_buf(),
            medium_name: "hdd".to_string(),
            location_type: LocationType::Store,
            low_watermark_bytes: 0,
            max_sessions: 64,
            io_rate_limit: None,
        }
    }

    #[test]
    fn initialize_creates_shard_directories() {
        let dir = tempfile::tempdir().unwrap();
        let location = Location::new(test_config(dir.path()), "test-location");
        let found = location.initialize().unwrap();
        assert!(found.is_empty());
        assert!(dir.path().join("chunks").join("00").is_dir());
        assert!(dir.path().join("chunks").join("ff").is_dir());
    }

    #[test]
    fn disable_is_sticky_to_first_reason() {
        let dir = tempfile::tempdir().unwrap();
        let location = Location::new(test_config(dir.path()), "test-location");
        location.disable("disk full");
        location.disable("should not overwrite");
        assert_eq!(location.disable_reason().as_deref(), Some("disk full"));
        assert!(!location.has_enough_space(0));
    }

    #[test]
    fn used_space_tracks_increments_and_decrements() {
        let dir = tempfile::tempdir().unwrap();
        let location = Location::new(test_config(dir.path()), "test-location");
        location.update_used_space(1000);
        location.update_used_space(-400);
        assert_eq!(location.used_space_bytes(), 600);
    }
}
