//! Journal write session (§3, §4.3 "journal variant analogous").
//!
//! Shares the blob session's window state machine (`Empty -> Received ->
//! Written`, ascending-index dispatch to the location's writer invoker)
//! but differs in two ways the spec calls out: there is no upper bound on
//! `Finish`'s expected block count (an append-only chunk's producer seals
//! it whenever it decides to, not at a count fixed up front), and the
//! chunk may be read by local readers while the session is still active
//! (§3 "a chunk is either active ... only journal chunks can be read
//! while active"). Grounded on
//! `original_source/.../ordered_dynamic_store.cpp` append semantics,
//! reshaped into the same control/writer-invoker split as
//! [`crate::session::BlobWriteSession`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use cnode_api_types::{ChunkId, ClusterError};
use cnode_io::Location;

use crate::memory::{MemoryGuard, MemoryTracker};
use crate::registry::ChunkRegistry;
use crate::session::ChunkMeta;
use crate::session_manager::Lease;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotState {
    Empty,
    Received,
    Written,
}

struct Slot {
    state: SlotState,
    data: Option<Arc<[u8]>>,
    memory_guard: Option<MemoryGuard>,
}

struct JournalWindow {
    slots: Vec<Slot>,
    window_start: usize,
    window_index: usize,
    size: u64,
    writer: Option<tokio::fs::File>,
}

pub struct JournalWriteSession {
    chunk_id: ChunkId,
    location: Arc<Location>,
    registry: Arc<ChunkRegistry>,
    memory_tracker: Arc<MemoryTracker>,
    window: Mutex<JournalWindow>,
    failed: Mutex<Option<ClusterError>>,
    sealed: std::sync::atomic::AtomicBool,
    total_blocks_received: AtomicUsize,
    lease: Arc<Lease>,
}

impl JournalWriteSession {
    pub fn new(
        chunk_id: ChunkId,
        location: Arc<Location>,
        registry: Arc<ChunkRegistry>,
        memory_tracker: Arc<MemoryTracker>,
        lease: Arc<Lease>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            chunk_id,
            location,
            registry,
            memory_tracker,
            window: Mutex::new(JournalWindow {
                slots: Vec::new(),
                window_start: 0,
                window_index: 0,
                size: 0,
                writer: None,
            }),
            failed: Mutex::new(None),
            sealed: std::sync::atomic::AtomicBool::new(false),
            total_blocks_received: AtomicUsize::new(0),
            lease,
        });
        session.start();
        session
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    fn start(self: &Arc<Self>) {
        let this = self.clone();
        let path = self.location.chunk_path(&self.chunk_id);
        let invoker = self.location.write_invoker().clone();
        tokio::spawn(async move {
            let opened = invoker
                .run(move || {
                    Box::pin(async move {
                        tokio::fs::OpenOptions::new()
                            .write(true)
                            .create(true)
                            .truncate(false)
                            .open(&path)
                            .await
                    })
                })
                .await;

            match opened {
                Ok(Ok(file)) => this.window.lock().await.writer = Some(file),
                _ => *this.failed.lock().await = Some(ClusterError::IoError("open failed".into())),
            }
        });
    }

    /// `PutBlocks` equivalent for the append-only journal: blocks are
    /// always appended at `WindowIndex`; there is no explicit start index
    /// because a journal producer writes its own rows strictly in order.
    pub async fn append_blocks(self: &Arc<Self>, blocks: Vec<Arc<[u8]>>) -> Result<(), ClusterError> {
        self.lease.touch();

        if let Some(err) = self.failed.lock().await.clone() {
            return Err(err);
        }
        if self.sealed.load(Ordering::SeqCst) {
            return Err(ClusterError::WindowError("session already sealed".into()));
        }

        let mut guards = Vec::with_capacity(blocks.len());
        for block in &blocks {
            match self.memory_tracker.try_acquire(block.len() as u64) {
                Some(guard) => guards.push(guard),
                None => return Err(ClusterError::WriteThrottlingActive),
            }
        }

        let mut window = self.window.lock().await;
        let mut batch = Vec::with_capacity(blocks.len());
        for (block, guard) in blocks.into_iter().zip(guards.into_iter()) {
            let index = window.slots.len();
            window.slots.push(Slot {
                state: SlotState::Received,
                data: Some(block.clone()),
                memory_guard: Some(guard),
            });
            window.size += block.len() as u64;
            self.location.update_used_space(block.len() as i64);
            batch.push((index, block));
        }
        self.total_blocks_received.fetch_add(batch.len(), Ordering::SeqCst);
        let begin = window.window_index;
        window.window_index += batch.len();
        drop(window);

        self.enqueue_write(begin, batch);
        Ok(())
    }

    fn enqueue_write(self: &Arc<Self>, begin_index: usize, batch: Vec<(usize, Arc<[u8]>)>) {
        let this = self.clone();
        let invoker = self.location.write_invoker().clone();
        tokio::spawn(async move {
            let end_index = begin_index + batch.len();
            let result = invoker
                .run(move || {
                    let this = this.clone();
                    Box::pin(async move {
                        let mut window = this.window.lock().await;
                        let writer = match window.writer.as_mut() {
                            Some(w) => w,
                            None => return Err(std::io::Error::new(std::io::ErrorKind::Other, "writer not open")),
                        };
                        for (_, data) in &batch {
                            writer.write_all(data).await?;
                        }
                        writer.flush().await?;
                        Ok(())
                    })
                })
                .await;

            let io_result = match result {
                Ok(inner) => inner,
                Err(_) => Err(std::io::Error::new(std::io::ErrorKind::Other, "writer invoker gone")),
            };

            let mut window = this.window.lock().await;
            for index in begin_index..end_index {
                if let Some(slot) = window.slots.get_mut(index) {
                    slot.memory_guard = None;
                    if io_result.is_ok() {
                        slot.state = SlotState::Written;
                    }
                }
            }
            let row_count = window.slots.len() as u64;
            let disk_space = window.size;
            drop(window);

            if let Err(io_err) = io_result {
                *this.failed.lock().await = Some(ClusterError::IoError(io_err.to_string()));
                this.location.mark_fatal();
                this.location.disable(io_err.to_string());
            } else {
                this.registry
                    .upsert_journal_chunk(this.chunk_id, this.location.clone(), disk_space, row_count);
            }
        });
    }

    /// Reads a block already durable on disk, permitted while the session
    /// is still active per §3's journal-chunk exception. Blocks still
    /// only `Received` (not yet `Written`) are not yet safe to serve since
    /// concurrent readers must never observe bytes the writer invoker
    /// could still fail to persist.
    pub async fn read_block(&self, index: usize) -> Option<Arc<[u8]>> {
        let window = self.window.lock().await;
        let slot = window.slots.get(index)?;
        if slot.state == SlotState::Written {
            slot.data.clone()
        } else {
            None
        }
    }

    pub async fn block_count(&self) -> usize {
        self.window.lock().await.slots.len()
    }

    /// Seals the chunk (§3 "sealed when its producer finishes"). Unlike
    /// the blob variant's `Finish`, no expected block count is checked —
    /// the open question this resolves (§9) is that an append-only
    /// journal has no way to know its final length in advance.
    pub async fn seal(self: &Arc<Self>, _chunk_meta: ChunkMeta) -> Result<(), ClusterError> {
        if let Some(err) = self.failed.lock().await.clone() {
            return Err(err);
        }

        let mut window = self.window.lock().await;
        for index in window.window_start..window.slots.len() {
            if window.slots[index].state != SlotState::Written {
                return Err(ClusterError::WindowError(format!(
                    "unwritten block {index} at seal"
                )));
            }
        }
        if let Some(mut writer) = window.writer.take() {
            writer.flush().await.map_err(|e| ClusterError::IoError(e.to_string()))?;
        }
        drop(window);

        self.sealed.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn cancel(self: &Arc<Self>, reason: ClusterError) {
        *self.failed.lock().await = Some(reason);
        let path = self.location.chunk_path(&self.chunk_id);
        let _ = tokio::fs::remove_file(&path).await;
        self.registry.unregister_chunk(&self.chunk_id);
    }
}
