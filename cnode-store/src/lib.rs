//! Chunk registry (store + cache), the blob and journal write sessions,
//! the local block read path, the artifact cache and the session manager
//! (§4.2–§4.6).

pub mod artifact_cache;
pub mod artifact_key;
pub mod journal_session;
pub mod memory;
pub mod read_path;
pub mod registry;
pub mod session;
pub mod session_manager;

pub use artifact_cache::{ArtifactCache, ArtifactSource, CachedArtifact};
pub use artifact_key::{ArtifactFingerprint, ArtifactFormat, ArtifactKey, ChunkSpec, DataSourceType};
pub use journal_session::JournalWriteSession;
pub use memory::{MemoryGuard, MemoryTracker};
pub use read_path::{Block, BlockCache, LocalChunkReader, ReadFailureHandler, ReadOptions};
pub use registry::{CandidateChunk, ChunkRegistry, DedupOutcome, RegisteredChunk};
pub use session::{BlobWriteSession, ChunkMeta, ReplicaTarget};
pub use session_manager::{Lease, SessionHandle, SessionManager, SessionOptions};
