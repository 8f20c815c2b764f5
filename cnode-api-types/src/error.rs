/// Stable wire error codes (§6/§7).
///
/// These are the only errors that cross the RPC boundary as structured
/// values; everything else propagates as an `anyhow::Error` with this as
/// its innermost, authoritative cause (the nested-error convention in
/// §7: each layer adds context, the innermost code decides behavior).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("no such chunk")]
    NoSuchChunk,

    #[error("no such session")]
    NoSuchSession,

    #[error("window error: {0}")]
    WindowError(String),

    #[error("block content mismatch")]
    BlockContentMismatch,

    #[error("no location available")]
    NoLocationAvailable,

    #[error("out of space")]
    OutOfSpace,

    #[error("io error: {0}")]
    IoError(String),

    #[error("invalid block checksum")]
    InvalidBlockChecksum,

    #[error("write throttling active")]
    WriteThrottlingActive,

    #[error("local chunk reader failed: {0}")]
    LocalChunkReaderFailed(String),
}

impl ClusterError {
    /// Transient-retriable errors are safe for a caller to retry without
    /// having mutated session state (§7).
    pub fn is_retriable(&self) -> bool {
        matches!(self, ClusterError::WriteThrottlingActive)
    }

    /// Errors that indicate the underlying location is broken and must be
    /// disabled rather than merely failing the current operation (§4.3).
    pub fn is_fatal_to_location(&self) -> bool {
        matches!(self, ClusterError::IoError(_))
    }
}
