//! Chunk registry (§4.2): the durable **store** variant and the bounded,
//! SLRU-evicting **cache** variant share this implementation, varying only
//! in whether a capacity is supplied.
//!
//! Grounded on `pbs_datastore::chunk_store::ChunkStore` for the identity
//! and startup-dedup invariants, and on
//! `original_source/yt/yt/server/node/data_node/chunk_store.cpp` for the
//! secondary per-type-tag index that keeps `GetNewChunkLocation` and GC
//! sweeps from scanning the whole map.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use anyhow::{bail, Context, Error};

use cnode_api_types::{ChunkId, EObjectType};
use cnode_io::Location;
use cnode_tools::{Weighted, WeightedLruCache};

/// An entry the registry has accepted. Immutable once constructed; the
/// dedup-replacement path builds a fresh one rather than mutating in
/// place, so lookups never observe a half-updated record.
#[derive(Debug, Clone)]
pub struct RegisteredChunk {
    pub id: ChunkId,
    pub location: Arc<Location>,
    pub disk_space: u64,
    pub inode: u64,
    pub modified: SystemTime,
    /// Row count, meaningful only for journal chunks (§4.2 dedup rule);
    /// `None` for every other object type.
    pub row_count: Option<u64>,
    /// Monotonic version of the in-memory registration record (§3: "a
    /// chunk's bytes on disk are immutable after Finish. Versioning
    /// applies only to the in-memory registration record — journal chunks
    /// bump a monotonic version on state change"). Always 0 for sealed
    /// blob/erasure/artifact chunks.
    pub version: u64,
}

impl Weighted for Arc<RegisteredChunk> {
    fn weight(&self) -> u64 {
        self.disk_space
    }
}

/// Everything `RegisterExistingChunk` needs to know about a chunk found on
/// disk during a location's startup scan (§4.2).
#[derive(Debug, Clone)]
pub struct CandidateChunk {
    pub id: ChunkId,
    pub location: Arc<Location>,
    pub disk_space: u64,
    pub inode: u64,
    pub modified: SystemTime,
    pub row_count: Option<u64>,
}

/// What the caller must physically do after a startup-dedup decision.
/// The registry never deletes files itself (§4.2): "file deletion is
/// scheduled on the location's write pool."
#[derive(Debug)]
pub enum DedupOutcome {
    /// No prior entry; the candidate is now registered.
    Registered,
    /// A prior entry already won; the candidate's own file is the one to
    /// remove (it was never registered).
    DiscardCandidate,
    /// The candidate won; the previously-registered replica is now
    /// unregistered and its file should be removed.
    ReplacedExisting(Arc<RegisteredChunk>),
}

struct Index {
    by_id: HashMap<ChunkId, Arc<RegisteredChunk>>,
    by_type: HashMap<EObjectType, std::collections::HashSet<ChunkId>>,
}

impl Index {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_type: HashMap::new(),
        }
    }

    fn insert(&mut self, chunk: Arc<RegisteredChunk>) {
        let object_type = chunk
            .id
            .object_type()
            .expect("only ids with a valid object-type tag are ever registered");
        self.by_type.entry(object_type).or_default().insert(chunk.id);
        self.by_id.insert(chunk.id, chunk);
    }

    fn remove(&mut self, id: &ChunkId) -> Option<Arc<RegisteredChunk>> {
        let removed = self.by_id.remove(id)?;
        if let Ok(object_type) = id.object_type() {
            if let Some(set) = self.by_type.get_mut(&object_type) {
                set.remove(id);
            }
        }
        Some(removed)
    }
}

/// Registration and unregistration are expected to run serialized on a
/// single control invoker (§4.2); this type itself only guarantees
/// internal consistency under concurrent lock-free reads, not cross-call
/// atomicity, matching "lookups are lock-free reads ... implementer may
/// choose ... a reader-writer lock."
pub struct ChunkRegistry {
    index: RwLock<Index>,
    /// `Some` for the bounded cache variant; capacity enforcement runs
    /// under its own lock since eviction must mutate recency order even
    /// on reads.
    eviction: Option<std::sync::Mutex<WeightedLruCache<ChunkId, Arc<RegisteredChunk>>>>,
}

impl ChunkRegistry {
    /// The durable store variant: unbounded, nothing is ever evicted.
    pub fn unbounded() -> Self {
        Self {
            index: RwLock::new(Index::new()),
            eviction: None,
        }
    }

    /// The bounded cache variant: entries are evicted SLRU-style once the
    /// sum of `disk_space` crosses `capacity_bytes` (§4.2 "weight = chunk
    /// disk footprint").
    pub fn bounded(capacity_bytes: u64) -> Self {
        Self {
            index: RwLock::new(Index::new()),
            eviction: Some(std::sync::Mutex::new(WeightedLruCache::new(capacity_bytes))),
        }
    }

    /// For the bounded cache variant, `eviction` is the single source of
    /// truth for membership: `index` is a secondary lookup structure
    /// (`by_id`/`by_type`) that must never claim a chunk the LRU has
    /// already evicted, so `len`/`is_empty`/`contains`/`get` all defer to
    /// it when present rather than to `index`.
    pub fn len(&self) -> usize {
        if let Some(eviction) = &self.eviction {
            return eviction.lock().unwrap().len();
        }
        self.index.read().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &ChunkId) -> Option<Arc<RegisteredChunk>> {
        if let Some(eviction) = &self.eviction {
            return eviction.lock().unwrap().get_mut(id).cloned();
        }
        self.index.read().unwrap().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        if let Some(eviction) = &self.eviction {
            return eviction.lock().unwrap().contains(id);
        }
        self.index.read().unwrap().by_id.contains_key(id)
    }

    /// Removes ids the LRU just evicted from `index` too, so the
    /// secondary `by_id`/`by_type` lookup never outlives the `Arc` the
    /// LRU actually dropped (§4.2: "evicted chunk's file deletion is
    /// deferred until the cached chunk object is destroyed").
    fn prune_evicted(&self, evicted: Vec<ChunkId>) {
        if evicted.is_empty() {
            return;
        }
        let mut index = self.index.write().unwrap();
        for id in evicted {
            index.remove(&id);
        }
    }

    /// `RegisterNewChunk` (§4.2): a duplicate id here is a fatal invariant
    /// violation, not a retriable error — two independent code paths
    /// raced to mint the same id. Callers MUST treat an `Err` as a bug to
    /// crash on, never as something to retry.
    pub fn register_new_chunk(&self, chunk: RegisteredChunk) -> Result<(), Error> {
        let chunk = Arc::new(chunk);
        let mut index = self.index.write().unwrap();
        if index.by_id.contains_key(&chunk.id) {
            bail!("fatal: duplicate chunk id {} registered twice", chunk.id);
        }
        index.insert(chunk.clone());
        drop(index);

        if let Some(eviction) = &self.eviction {
            let evicted = eviction.lock().unwrap().insert(chunk.id, chunk.clone(), chunk.disk_space);
            self.prune_evicted(evicted);
        }

        Ok(())
    }

    /// `RegisterExistingChunk` (§4.2), startup only: resolves a collision
    /// between a chunk already registered from an earlier scan and a new
    /// candidate found on disk by the dedup rules spec'd for blob/erasure
    /// and journal chunks. Any other shape of collision is fatal — it
    /// means the on-disk layout is corrupt in a way the node cannot
    /// reason about safely.
    pub fn register_existing_chunk(&self, candidate: CandidateChunk) -> Result<DedupOutcome, Error> {
        let object_type = candidate
            .id
            .object_type()
            .with_context(|| format!("chunk {} has unrecognized object type", candidate.id))?;

        let existing = self.index.read().unwrap().by_id.get(&candidate.id).cloned();
        let Some(existing) = existing else {
            self.register_new_chunk(RegisteredChunk {
                id: candidate.id,
                location: candidate.location,
                disk_space: candidate.disk_space,
                inode: candidate.inode,
                modified: candidate.modified,
                row_count: candidate.row_count,
                version: 0,
            })?;
            return Ok(DedupOutcome::Registered);
        };

        if existing.inode == candidate.inode {
            bail!(
                "fatal: chunk {} is aliased by two paths onto the same inode {}",
                candidate.id,
                candidate.inode
            );
        }

        match object_type {
            EObjectType::Blob | EObjectType::Erasure if existing.disk_space == candidate.disk_space => {
                if existing.modified <= candidate.modified {
                    Ok(DedupOutcome::DiscardCandidate)
                } else {
                    self.replace(candidate)
                }
            }
            EObjectType::Journal => match (existing.row_count, candidate.row_count) {
                (Some(old_rows), Some(new_rows)) if new_rows > old_rows => self.replace(candidate),
                (Some(old_rows), Some(new_rows)) if new_rows < old_rows => Ok(DedupOutcome::DiscardCandidate),
                _ => bail!(
                    "fatal: duplicate journal chunk {} with indistinguishable row counts",
                    candidate.id
                ),
            },
            _ => bail!(
                "fatal: duplicate chunk {} with no applicable dedup rule ({:?}, {} vs {} bytes)",
                candidate.id,
                object_type,
                existing.disk_space,
                candidate.disk_space
            ),
        }
    }

    fn replace(&self, candidate: CandidateChunk) -> Result<DedupOutcome, Error> {
        let previous_version = self.index.read().unwrap().by_id.get(&candidate.id).map(|c| c.version).unwrap_or(0);
        let replacement = Arc::new(RegisteredChunk {
            id: candidate.id,
            location: candidate.location,
            disk_space: candidate.disk_space,
            inode: candidate.inode,
            modified: candidate.modified,
            row_count: candidate.row_count,
            version: previous_version + 1,
        });

        let mut index = self.index.write().unwrap();
        let previous = index
            .remove(&replacement.id)
            .expect("caller already confirmed an existing entry");
        index.insert(replacement.clone());
        drop(index);

        if let Some(eviction) = &self.eviction {
            let id = replacement.id;
            let weight = replacement.disk_space;
            let evicted = {
                let mut eviction = eviction.lock().unwrap();
                eviction.remove(&id);
                eviction.insert(id, replacement, weight)
            };
            self.prune_evicted(evicted);
        }

        Ok(DedupOutcome::ReplacedExisting(previous))
    }

    /// `UnregisterChunk` (§4.2): idempotent, does not touch the
    /// filesystem. Returns whether an entry was actually present.
    pub fn unregister_chunk(&self, id: &ChunkId) -> bool {
        let removed = {
            let mut index = self.index.write().unwrap();
            index.remove(id)
        };
        if let Some(eviction) = &self.eviction {
            eviction.lock().unwrap().remove(id);
        }
        if removed.is_some() {
            log::debug!("chunk {id} unregistered");
        }
        removed.is_some()
    }

    /// `RemoveChunk` (§4.2): schedules on-disk removal on the owning
    /// location's write invoker, serialising against any in-flight reads
    /// of that file, then unregisters.
    pub async fn remove_chunk(&self, id: &ChunkId) -> Result<(), Error> {
        let Some(chunk) = self.get(id) else {
            return Ok(());
        };

        let path = chunk.location.chunk_path(id);
        chunk
            .location
            .write_invoker()
            .run(move || {
                Box::pin(async move {
                    match std::fs::remove_file(&path) {
                        Ok(()) => Ok(()),
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(err) => Err(err),
                    }
                })
            })
            .await?
            .with_context(|| format!("removing chunk file for {id}"))?;

        self.unregister_chunk(id);
        chunk.location.update_used_space(-(chunk.disk_space as i64));
        chunk.location.update_chunk_count(-1);
        Ok(())
    }

    /// Registers or re-registers a journal chunk in place, bumping its
    /// version (§3: "journal chunks bump a monotonic version on state
    /// change"). Used by the journal write session after every flush of a
    /// still-active chunk, where blob/erasure sessions only ever register
    /// once, at `Finish`.
    pub fn upsert_journal_chunk(
        &self,
        id: ChunkId,
        location: Arc<Location>,
        disk_space: u64,
        row_count: u64,
    ) -> Arc<RegisteredChunk> {
        let mut index = self.index.write().unwrap();
        let version = index.by_id.get(&id).map(|c| c.version + 1).unwrap_or(0);
        let chunk = Arc::new(RegisteredChunk {
            id,
            location,
            disk_space,
            inode: 0,
            modified: SystemTime::now(),
            row_count: Some(row_count),
            version,
        });
        index.remove(&id);
        index.insert(chunk.clone());
        chunk
    }

    /// `GetNewChunkLocation` (§4.2): among `candidates` that are enabled
    /// and report enough space for a zero-size probe, picks uniformly at
    /// random among those tied for the fewest active sessions.
    pub fn get_new_chunk_location(
        &self,
        candidates: &[Arc<Location>],
    ) -> Result<Arc<Location>, Error> {
        let eligible: Vec<&Arc<Location>> = candidates
            .iter()
            .filter(|loc| !loc.is_disabled() && loc.has_enough_space(0))
            .collect();

        let Some(min_sessions) = eligible.iter().map(|loc| loc.active_session_count()).min() else {
            return Err(cnode_api_types::ClusterError::OutOfSpace.into());
        };

        let least_loaded: Vec<&Arc<Location>> = eligible
            .into_iter()
            .filter(|loc| loc.active_session_count() == min_sessions)
            .collect();

        let index = rand::Rng::gen_range(&mut rand::thread_rng(), 0..least_loaded.len());
        Ok(least_loaded[index].clone())
    }
}
