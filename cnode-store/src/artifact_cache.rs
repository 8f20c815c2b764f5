//! Artifact cache (§4.5): a bounded async SLRU cache indexed by
//! [`ArtifactKey`], backed by [`cnode_tools::AsyncLruCache`] for the
//! single-downloader-per-key guarantee and by the location's write
//! invoker for the actual disk traffic.
//!
//! Grounded on `pbs-datastore::chunk_store::ChunkStore::Initialize`'s
//! orphan-temp-file removal pattern for the startup validation scan, and
//! on `file_formats.rs`'s fixed-header-plus-payload layout (there:
//! `DataBlobHeader { magic, crc }`; here: `signature`, `version`, then
//! the serialised key) for the on-disk meta sidecar.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;
use endian_trait::Endian;
use proxmox_io::{ReadExt, WriteExt};

use cnode_api_types::{ChunkId, ClusterError, EObjectType};
use cnode_io::{Location, Throttler};
use cnode_tools::{AsyncCacher, AsyncLruCache, Weighted};

use crate::artifact_key::{ArtifactFingerprint, ArtifactKey, DataSourceType};

/// Fixed 16-byte prefix of every `<chunkfile>.meta` sidecar (§4.5 table).
/// `sha256(b"YT artifact meta header v1")[0..8]` would be the usual way
/// to derive a magic like this in the corpus; the literal value is
/// mandated by the spec table instead, so it's spelled out directly
/// rather than derived.
const ARTIFACT_META_SIGNATURE: u64 = 0x313030484d415459;
const ARTIFACT_META_VERSION: u64 = 4;

#[derive(Endian)]
#[repr(C, packed)]
struct ArtifactMetaHeader {
    signature: u64,
    version: u64,
}

/// What the artifact cache hands back on a hit or a completed download.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub chunk_id: ChunkId,
    pub location: Arc<Location>,
    pub disk_space: u64,
}

impl Weighted for CachedArtifact {
    fn weight(&self) -> u64 {
        self.disk_space
    }
}

/// The seam a downloader branch reads raw chunk/file/table bytes through.
/// No live transport or query engine is implemented here — out of scope
/// per spec.md's non-goals, the same way [`crate::session::ReplicaTarget`]
/// stands in for `SendBlocks`'s replication without a socket underneath.
#[async_trait::async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn read_chunk(&self, chunk_id: ChunkId) -> Result<Arc<[u8]>, ClusterError>;
    async fn stream_file(&self, chunk_specs: &[crate::artifact_key::ChunkSpec]) -> Result<Vec<u8>, ClusterError>;
    async fn stream_table(
        &self,
        chunk_specs: &[crate::artifact_key::ChunkSpec],
        schema: Option<&str>,
        column_filter: Option<&[String]>,
        format: crate::artifact_key::ArtifactFormat,
    ) -> Result<Vec<u8>, ClusterError>;
}

pub struct ArtifactCache {
    cache: AsyncLruCache<ArtifactFingerprint, CachedArtifact>,
    locations: Vec<Arc<Location>>,
    node_throttler: Arc<Throttler>,
    source: Arc<dyn ArtifactSource>,
}

impl ArtifactCache {
    pub fn new(
        capacity_bytes: u64,
        locations: Vec<Arc<Location>>,
        node_throttler: Arc<Throttler>,
        source: Arc<dyn ArtifactSource>,
    ) -> Self {
        Self {
            cache: AsyncLruCache::new(capacity_bytes),
            locations,
            node_throttler,
            source,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Hit returns the existing chunk; miss reserves an insertion cookie
    /// (the `AsyncLruCache`'s in-flight map entry) and runs exactly one
    /// downloader for `key`, even under concurrent callers (§4.5
    /// "exactly one downloader runs per ArtifactKey").
    pub async fn get_or_download(&self, key: &ArtifactKey) -> Result<CachedArtifact, ClusterError> {
        let fingerprint = key.fingerprint();
        let downloader = Downloader {
            key: key.clone(),
            locations: self.locations.clone(),
            node_throttler: self.node_throttler.clone(),
            source: self.source.clone(),
        };

        match self.cache.access(fingerprint, &downloader).await {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => unreachable!("a downloader never returns Ok(None)"),
            Err(err) => Err(ClusterError::IoError(err.to_string())),
        }
    }

    /// Startup validation scan (§4.5, §8 scenario 6): walks each
    /// location's chunk tree, classifying every file by its id's
    /// object-type tag (§3: "the type tag is authoritative and drives
    /// branch selection ... MUST be extractable without consulting any
    /// external metadata") rather than by which sidecar files happen to
    /// exist, and discarding anything that fails validation. Survivors
    /// are re-registered into the in-memory index so warm restarts don't
    /// refetch everything.
    pub async fn validate_on_startup(&self) -> Result<(), Error> {
        for location in &self.locations {
            let found = location.initialize()?;
            for descriptor in found {
                match descriptor.chunk_id.object_type() {
                    Ok(EObjectType::Artifact) => self.validate_artifact_chunk(location, &descriptor.chunk_id),
                    Ok(EObjectType::Blob) | Ok(EObjectType::Erasure) => {
                        validate_non_artifact_chunk(location, &descriptor.chunk_id, descriptor.disk_space)
                    }
                    // Journal chunks are validated by their own
                    // active/sealed lifecycle (§3), not by this cache's
                    // fixed-size corruption check.
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn validate_artifact_chunk(&self, location: &Arc<Location>, chunk_id: &ChunkId) {
        let meta_path = artifact_meta_path(location, chunk_id);
        match load_and_validate_meta(&meta_path) {
            Ok(key) => {
                let chunk_path = location.chunk_path(chunk_id);
                let disk_space = std::fs::metadata(&chunk_path).map(|m| m.len()).unwrap_or(0);
                let entry = CachedArtifact {
                    chunk_id: *chunk_id,
                    location: location.clone(),
                    disk_space,
                };
                self.cache.admit(key.fingerprint(), entry);
            }
            Err(reason) => {
                log::warn!("removing corrupt artifact chunk {chunk_id} at startup: {reason}");
                let _ = std::fs::remove_file(location.chunk_path(chunk_id));
                let _ = std::fs::remove_file(&meta_path);
            }
        }
    }
}

/// §4.5/§8 scenario 6: "read `misc` extension from its chunk meta; if
/// `compressedDataSize != fileLength` the chunk is corrupt (power-loss
/// truncation is the expected cause) and MUST be removed." A missing
/// meta file is treated the same way — per §7, "partial files MUST be
/// removable by the next startup scan" — since [`crate::session`] only
/// ever writes the data file and its meta sidecar together at `Finish`.
fn validate_non_artifact_chunk(location: &Arc<Location>, chunk_id: &ChunkId, file_length: u64) {
    let meta_path = location.chunk_path(chunk_id).with_extension("meta");
    let reason = match read_compressed_data_size(&meta_path) {
        Ok(compressed_data_size) if compressed_data_size == file_length => return,
        Ok(compressed_data_size) => {
            format!("misc.compressedDataSize {compressed_data_size} != file length {file_length}")
        }
        Err(reason) => reason,
    };
    log::warn!("removing corrupt chunk {chunk_id} at startup: {reason}");
    let _ = std::fs::remove_file(location.chunk_path(chunk_id));
    let _ = std::fs::remove_file(&meta_path);
}

fn read_compressed_data_size(meta_path: &std::path::Path) -> Result<u64, String> {
    let bytes = std::fs::read(meta_path).map_err(|e| format!("reading meta: {e}"))?;
    let meta: crate::session::ChunkMeta = serde_json::from_slice(&bytes).map_err(|e| format!("parsing meta: {e}"))?;
    let misc = meta
        .extensions
        .get("misc")
        .ok_or_else(|| "meta has no misc extension".to_string())?;
    misc.get("compressedDataSize")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| "misc extension has no compressedDataSize".to_string())
}

fn artifact_meta_path(location: &Location, chunk_id: &ChunkId) -> PathBuf {
    let mut path = location.chunk_path(chunk_id).into_os_string();
    path.push(".meta");
    PathBuf::from(path)
}

/// Loads and validates a `.meta` sidecar per §4.5's artifact branch:
/// "meta file shorter than the header, or signature mismatch, or version
/// mismatch, or key deserialisation failure ⇒ remove both files."
fn load_and_validate_meta(path: &std::path::Path) -> Result<ArtifactKey, String> {
    let raw = std::fs::read(path).map_err(|e| e.to_string())?;
    let header_len = std::mem::size_of::<ArtifactMetaHeader>();
    if raw.len() < header_len {
        return Err("meta file shorter than header".to_string());
    }

    let header: ArtifactMetaHeader = (&raw[..header_len])
        .read_le_value()
        .map_err(|e| format!("malformed meta header: {e}"))?;
    if header.signature != ARTIFACT_META_SIGNATURE {
        return Err("meta signature mismatch".to_string());
    }
    if header.version != ARTIFACT_META_VERSION {
        return Err("meta version mismatch".to_string());
    }

    serde_json::from_slice(&raw[header_len..]).map_err(|e| format!("key deserialization failed: {e}"))
}

fn encode_artifact_meta(key: &ArtifactKey) -> Result<Vec<u8>, ClusterError> {
    let header = ArtifactMetaHeader {
        signature: ARTIFACT_META_SIGNATURE,
        version: ARTIFACT_META_VERSION,
    };
    let mut out = Vec::new();
    out.write_le_value(header)
        .map_err(|e| ClusterError::IoError(e.to_string()))?;
    let key_bytes = serde_json::to_vec(key).map_err(|e| ClusterError::IoError(e.to_string()))?;
    out.extend_from_slice(&key_bytes);
    Ok(out)
}

fn pick_location(locations: &[Arc<Location>]) -> Result<Arc<Location>, ClusterError> {
    let eligible: Vec<&Arc<Location>> = locations
        .iter()
        .filter(|loc| !loc.is_disabled() && loc.has_enough_space(0))
        .collect();
    if eligible.is_empty() {
        return Err(ClusterError::OutOfSpace);
    }
    let min_sessions = eligible.iter().map(|loc| loc.active_session_count()).min().unwrap();
    let least_loaded: Vec<&Arc<Location>> = eligible
        .into_iter()
        .filter(|loc| loc.active_session_count() == min_sessions)
        .collect();
    let index = rand::Rng::gen_range(&mut rand::thread_rng(), 0..least_loaded.len());
    Ok(least_loaded[index].clone())
}

struct Downloader {
    key: ArtifactKey,
    locations: Vec<Arc<Location>>,
    node_throttler: Arc<Throttler>,
    source: Arc<dyn ArtifactSource>,
}

impl AsyncCacher<ArtifactFingerprint, CachedArtifact> for Downloader {
    fn fetch(
        &self,
        _fingerprint: ArtifactFingerprint,
    ) -> Box<dyn std::future::Future<Output = Result<Option<CachedArtifact>, Error>> + Send> {
        let key = self.key.clone();
        let locations = self.locations.clone();
        let node_throttler = self.node_throttler.clone();
        let source = self.source.clone();
        Box::new(async move {
            let entry = download_artifact(&key, &locations, &node_throttler, source.as_ref()).await?;
            Ok(Some(entry))
        })
    }
}

async fn download_artifact(
    key: &ArtifactKey,
    locations: &[Arc<Location>],
    node_throttler: &Throttler,
    source: &dyn ArtifactSource,
) -> Result<CachedArtifact, ClusterError> {
    let location = pick_location(locations)?;

    // Branch 1 (§4.5): single-chunk, non-erasure, no transform — the
    // chunk is downloaded verbatim under its own id, no meta sidecar.
    if let Some(chunk_id) = key.as_trivial_single_chunk() {
        if matches!(chunk_id.object_type(), Ok(EObjectType::Blob)) {
            return download_raw_chunk(chunk_id, location, node_throttler, source).await;
        }
    }

    let chunk_id = ChunkId::new_random(EObjectType::Artifact);
    let bytes = match key {
        ArtifactKey::Composite {
            data_source_type: DataSourceType::Table,
            chunk_specs,
            schema,
            column_filter,
            format,
            ..
        } => {
            source
                .stream_table(chunk_specs, schema.as_deref(), column_filter.as_deref(), *format)
                .await?
        }
        ArtifactKey::Composite { chunk_specs, .. } => source.stream_file(chunk_specs).await?,
        ArtifactKey::SingleChunk(id) => source.stream_file(&[crate::artifact_key::ChunkSpec {
            chunk_id: *id,
            first_block: 0,
            block_count: u64::MAX,
        }]).await?,
    };

    write_synthesized_artifact(chunk_id, location, node_throttler, key, bytes).await
}

async fn download_raw_chunk(
    chunk_id: ChunkId,
    location: Arc<Location>,
    node_throttler: &Throttler,
    source: &dyn ArtifactSource,
) -> Result<CachedArtifact, ClusterError> {
    let bytes = source.read_chunk(chunk_id).await?;
    node_throttler.acquire(bytes.len() as u64).await;
    let disk_space = bytes.len() as u64;
    write_error_intercepting(&location, location.chunk_path(&chunk_id), bytes.to_vec()).await?;
    location.update_used_space(disk_space as i64);
    location.update_chunk_count(1);
    Ok(CachedArtifact {
        chunk_id,
        location,
        disk_space,
    })
}

async fn write_synthesized_artifact(
    chunk_id: ChunkId,
    location: Arc<Location>,
    node_throttler: &Throttler,
    key: &ArtifactKey,
    bytes: Vec<u8>,
) -> Result<CachedArtifact, ClusterError> {
    node_throttler.acquire(bytes.len() as u64).await;
    let disk_space = bytes.len() as u64;

    write_error_intercepting(&location, location.chunk_path(&chunk_id), bytes).await?;

    let meta_bytes = encode_artifact_meta(key)?;
    write_error_intercepting(&location, artifact_meta_path(&location, &chunk_id), meta_bytes).await?;

    location.update_used_space(disk_space as i64);
    location.update_chunk_count(1);
    Ok(CachedArtifact {
        chunk_id,
        location,
        disk_space,
    })
}

/// Writes `bytes` to `path` on `location`'s write invoker. Any I/O error
/// disables the location (§4.5 "error-intercepting output that redirects
/// every exception to `Location.Disable`") before being surfaced.
async fn write_error_intercepting(location: &Arc<Location>, path: PathBuf, bytes: Vec<u8>) -> Result<(), ClusterError> {
    let invoker = location.write_invoker().clone();
    let result = invoker
        .run(move || Box::pin(async move { tokio::fs::write(&path, &bytes).await }))
        .await;

    let io_result = match result {
        Ok(inner) => inner,
        Err(_) => Err(std::io::Error::new(std::io::ErrorKind::Other, "writer invoker gone")),
    };

    if let Err(err) = io_result {
        location.mark_fatal();
        location.disable(err.to_string());
        return Err(ClusterError::IoError(err.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_key::ChunkSpec;
    use cnode_io::{LocationConfig, LocationType};

    fn test_location(dir: &std::path::Path) -> Arc<Location> {
        let location = Arc::new(Location::new(
            LocationConfig {
                path: dir.to_path_buf(),
                medium_name: "hdd".to_string(),
                location_type: LocationType::Store,
                low_watermark_bytes: 0,
                max_sessions: 64,
                io_rate_limit: None,
            },
            "test-artifact-location",
        ));
        location.initialize().unwrap();
        location
    }

    struct FakeSource;

    #[async_trait::async_trait]
    impl ArtifactSource for FakeSource {
        async fn read_chunk(&self, _chunk_id: ChunkId) -> Result<Arc<[u8]>, ClusterError> {
            Ok(Arc::from(&b"raw-chunk-bytes"[..]))
        }

        async fn stream_file(&self, _chunk_specs: &[ChunkSpec]) -> Result<Vec<u8>, ClusterError> {
            Ok(b"file-bytes".to_vec())
        }

        async fn stream_table(
            &self,
            _chunk_specs: &[ChunkSpec],
            _schema: Option<&str>,
            _column_filter: Option<&[String]>,
            _format: crate::artifact_key::ArtifactFormat,
        ) -> Result<Vec<u8>, ClusterError> {
            Ok(b"{\"rows\":[]}".to_vec())
        }
    }

    fn cache(dir: &std::path::Path) -> (ArtifactCache, Arc<Location>) {
        let location = test_location(dir);
        let cache = ArtifactCache::new(
            1 << 20,
            vec![location.clone()],
            Arc::new(Throttler::unlimited()),
            Arc::new(FakeSource),
        );
        (cache, location)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_chunk_blob_artifact_downloads_raw() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _location) = cache(dir.path());
        let id = ChunkId::new_random(EObjectType::Blob);
        let key = ArtifactKey::SingleChunk(id);

        let entry = cache.get_or_download(&key).await.unwrap();
        assert_eq!(entry.chunk_id, id);
        assert_eq!(entry.disk_space, b"raw-chunk-bytes".len() as u64);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn composite_table_artifact_gets_synthesized_id_and_meta_file() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, location) = cache(dir.path());
        let key = ArtifactKey::Composite {
            data_source_type: DataSourceType::Table,
            chunk_specs: vec![ChunkSpec {
                chunk_id: ChunkId::new_random(EObjectType::Blob),
                first_block: 0,
                block_count: 4,
            }],
            schema: Some("id:int64".to_string()),
            column_filter: None,
            timestamp: None,
            format: crate::artifact_key::ArtifactFormat::Json,
        };

        let entry = cache.get_or_download(&key).await.unwrap();
        assert!(matches!(entry.chunk_id.object_type(), Ok(EObjectType::Artifact)));
        assert!(artifact_meta_path(&location, &entry.chunk_id).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_for_the_same_key_download_once() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _location) = cache(dir.path());
        let key = ArtifactKey::Composite {
            data_source_type: DataSourceType::File,
            chunk_specs: vec![],
            schema: None,
            column_filter: None,
            timestamp: None,
            format: crate::artifact_key::ArtifactFormat::Raw,
        };

        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { cache.get_or_download(&key).await.unwrap() }));
        }
        let mut ids = std::collections::HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap().chunk_id);
        }
        assert_eq!(ids.len(), 1, "all concurrent callers must observe the same downloaded chunk");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn startup_validation_removes_corrupt_artifact_meta() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, location) = cache(dir.path());

        let bogus_id = ChunkId::new_random(EObjectType::Artifact);
        std::fs::write(location.chunk_path(&bogus_id), b"payload").unwrap();
        std::fs::write(artifact_meta_path(&location, &bogus_id), b"not a valid header at all").unwrap();

        cache.validate_on_startup().await.unwrap();

        assert!(!location.chunk_path(&bogus_id).exists());
        assert!(!artifact_meta_path(&location, &bogus_id).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn startup_validation_removes_truncated_non_artifact_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, location) = cache(dir.path());

        let id = ChunkId::new_random(EObjectType::Blob);
        let data_path = location.chunk_path(&id);
        let meta_path = data_path.with_extension("meta");
        std::fs::write(&data_path, b"short").unwrap();
        let mut meta = crate::session::ChunkMeta::default();
        meta.extensions.insert(
            "misc".to_string(),
            serde_json::json!({ "compressedDataSize": data_path.metadata().unwrap().len() + 1 }),
        );
        std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

        cache.validate_on_startup().await.unwrap();

        assert!(!data_path.exists(), "truncated chunk must be removed");
        assert!(!meta_path.exists(), "its meta sidecar must be removed too");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn startup_validation_keeps_intact_non_artifact_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, location) = cache(dir.path());

        let id = ChunkId::new_random(EObjectType::Blob);
        let data_path = location.chunk_path(&id);
        let meta_path = data_path.with_extension("meta");
        std::fs::write(&data_path, b"intact-bytes").unwrap();
        let mut meta = crate::session::ChunkMeta::default();
        meta.extensions.insert(
            "misc".to_string(),
            serde_json::json!({ "compressedDataSize": data_path.metadata().unwrap().len() }),
        );
        std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

        cache.validate_on_startup().await.unwrap();

        assert!(data_path.exists());
        assert!(meta_path.exists());
    }
}
