//! Session manager (§4.6): `map<ChunkId, Session>` guarded by a
//! max-concurrent-session limit, plus the lease every write session is
//! touched on by `PutBlocks | GetBlock | FlushBlocks | SendBlocks` and
//! which expires the session if nothing touches it for `SessionTimeout`.
//!
//! Grounded on `original_source/.../session_manager.cpp` for the shape
//! (one map, one semaphore, one timeout sweep) and on `pbs-client`'s
//! upload queue for the idiom of using a `tokio::sync::Semaphore` to cap
//! concurrency rather than hand-rolling a counter with a condvar.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Error};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use cnode_api_types::{ChunkId, ClusterError, EObjectType};
use cnode_io::Location;

use crate::journal_session::JournalWriteSession;
use crate::memory::MemoryTracker;
use crate::registry::{ChunkRegistry, RegisteredChunk};
use crate::session::BlobWriteSession;

/// A session's renewable lease (§3 "Sessions": "A session's lease MUST be
/// renewed by any `PutBlocks | GetBlock | FlushBlocks | SendBlocks`
/// touch"). Expiry is checked, not pushed — the session manager's sweep
/// loop polls [`Lease::is_expired`] rather than scheduling a timer per
/// session.
pub struct Lease {
    deadline: Mutex<Instant>,
    timeout: Duration,
}

impl Lease {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            deadline: Mutex::new(Instant::now() + timeout),
            timeout,
        })
    }

    pub fn touch(&self) {
        *self.deadline.lock().unwrap() = Instant::now() + self.timeout;
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > *self.deadline.lock().unwrap()
    }
}

/// Either session variant the manager tracks, dispatched on the chunk
/// id's object-type tag at `StartSession` time (§4.6).
#[derive(Clone)]
pub enum SessionHandle {
    Blob(Arc<BlobWriteSession>),
    Journal(Arc<JournalWriteSession>),
}

impl SessionHandle {
    pub fn chunk_id(&self) -> ChunkId {
        match self {
            SessionHandle::Blob(s) => s.chunk_id(),
            SessionHandle::Journal(s) => s.chunk_id(),
        }
    }
}

struct Entry {
    handle: SessionHandle,
    location: Arc<Location>,
    lease: Arc<Lease>,
    _permit: OwnedSemaphorePermit,
}

/// Options a caller supplies to `StartSession` (§6 `StartChunk`).
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_window_index: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_window_index: 1 << 20,
        }
    }
}

pub struct SessionManager {
    sessions: Mutex<HashMap<ChunkId, Entry>>,
    semaphore: Arc<Semaphore>,
    session_timeout: Duration,
    registry: Arc<ChunkRegistry>,
    memory_tracker: Arc<MemoryTracker>,
    node_throttler: Arc<cnode_io::Throttler>,
    shutting_down: AtomicBool,
}

impl SessionManager {
    pub fn new(
        max_concurrent_sessions: usize,
        session_timeout: Duration,
        registry: Arc<ChunkRegistry>,
        memory_tracker: Arc<MemoryTracker>,
        node_throttler: Arc<cnode_io::Throttler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent_sessions)),
            session_timeout,
            registry,
            memory_tracker,
            node_throttler,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn get(&self, id: &ChunkId) -> Option<SessionHandle> {
        self.sessions.lock().unwrap().get(id).map(|e| e.handle.clone())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// `StartSession(id, options)` (§4.6): allocates a location via
    /// `GetNewChunkLocation`, mints a lease, and constructs the session
    /// variant the id's object-type tag calls for.
    pub async fn start_session(
        self: &Arc<Self>,
        id: ChunkId,
        candidate_locations: &[Arc<Location>],
        options: SessionOptions,
    ) -> Result<SessionHandle, Error> {
        if self.sessions.lock().unwrap().contains_key(&id) {
            anyhow::bail!("session for chunk {id} already exists");
        }

        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .context("too many concurrent write sessions")?;

        let location = self.registry.get_new_chunk_location(candidate_locations)?;
        location.session_started();

        let lease = Lease::new(self.session_timeout);
        let object_type = id.object_type()?;

        let handle = match object_type {
            EObjectType::Journal => SessionHandle::Journal(JournalWriteSession::new(
                id,
                location.clone(),
                self.registry.clone(),
                self.memory_tracker.clone(),
                lease.clone(),
            )),
            EObjectType::Blob | EObjectType::Erasure | EObjectType::Artifact => {
                let session = BlobWriteSession::new(
                    id,
                    location.clone(),
                    self.registry.clone(),
                    self.memory_tracker.clone(),
                    self.node_throttler.clone(),
                    options.max_window_index,
                    lease.clone(),
                );
                session.start();
                SessionHandle::Blob(session)
            }
        };

        self.sessions.lock().unwrap().insert(
            id,
            Entry {
                handle: handle.clone(),
                location,
                lease,
                _permit: permit,
            },
        );

        Ok(handle)
    }

    /// Removes the session entry unconditionally; all termination paths
    /// (`Finish | Cancel | LeaseExpire`) funnel through here so the map
    /// never retains a dead session (§3 "Sessions").
    fn remove(&self, id: &ChunkId) -> Option<SessionHandle> {
        let entry = self.sessions.lock().unwrap().remove(id)?;
        entry.location.session_finished();
        Some(entry.handle)
    }

    pub async fn finish_blob_session(
        self: &Arc<Self>,
        id: &ChunkId,
        chunk_meta: crate::session::ChunkMeta,
        expected_block_count: usize,
    ) -> Result<Arc<RegisteredChunk>, ClusterError> {
        let handle = self.get(id).ok_or(ClusterError::NoSuchSession)?;
        let SessionHandle::Blob(session) = handle else {
            return Err(ClusterError::NoSuchSession);
        };
        let result = session.finish(chunk_meta, expected_block_count).await;
        self.remove(id);
        result
    }

    pub async fn cancel_session(self: &Arc<Self>, id: &ChunkId, reason: ClusterError) {
        let Some(handle) = self.remove(id) else {
            return;
        };
        match handle {
            SessionHandle::Blob(session) => session.cancel(reason).await,
            SessionHandle::Journal(session) => session.cancel(reason).await,
        }
    }

    pub fn ping_session(&self, id: &ChunkId) -> Result<(), ClusterError> {
        let sessions = self.sessions.lock().unwrap();
        let entry = sessions.get(id).ok_or(ClusterError::NoSuchSession)?;
        entry.lease.touch();
        Ok(())
    }

    /// Runs forever, periodically cancelling any session whose lease has
    /// expired. Intended to be spawned once per data node.
    pub async fn run_lease_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        while !self.shutting_down.load(Ordering::SeqCst) {
            ticker.tick().await;
            let expired: Vec<ChunkId> = self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, entry)| entry.lease.is_expired())
                .map(|(id, _)| *id)
                .collect();

            for id in expired {
                log::warn!("session lease expired for chunk {id}, cancelling");
                self.cancel_session(&id, ClusterError::NoSuchSession).await;
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}
