//! Structural artifact key (§4.5, GLOSSARY "Artifact"): "a logically
//! cacheable input to a job, keyed by structural content, not by id. For
//! a single-chunk artifact it is the chunkId plus an empty transform; for
//! a composite artifact it is `(data-source-type, list<chunkSpec>,
//! optional schema, optional columnFilter, optional timestamp, format)`
//! with value-equality and a derived hash."
//!
//! Grounded on `pbs-datastore`'s treatment of digests as cache keys
//! (`[u8; 32]` everywhere a chunk identity is needed) for the idiom of
//! deriving a fixed-size, `Copy` fingerprint from a larger value type
//! rather than hashing the full key on every lookup.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use cnode_api_types::ChunkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSourceType {
    File,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactFormat {
    Raw,
    Yson,
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub chunk_id: ChunkId,
    pub first_block: u64,
    pub block_count: u64,
}

/// The structural descriptor keying the artifact cache. Two keys that
/// compare equal MUST produce byte-identical cached files (§4.5) — every
/// field that could change the downloader's output belongs here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKey {
    SingleChunk(ChunkId),
    Composite {
        data_source_type: DataSourceType,
        chunk_specs: Vec<ChunkSpec>,
        schema: Option<String>,
        column_filter: Option<Vec<String>>,
        timestamp: Option<u64>,
        format: ArtifactFormat,
    },
}

/// Cheap, `Copy` stand-in for an [`ArtifactKey`] used as the in-memory
/// cache's hash map key. Two distinct keys hashing to the same
/// fingerprint is a correctness risk only for the in-memory hot path; the
/// on-disk meta header always carries the full serialised key, so a cold
/// load re-derives identity from ground truth rather than from this
/// fingerprint (documented in DESIGN.md as a deliberate simplification,
/// since the pack carries no cryptographic digest crate to do this with a
/// collision-resistant hash instead of `DefaultHasher`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactFingerprint(u64);

impl ArtifactKey {
    pub fn fingerprint(&self) -> ArtifactFingerprint {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        ArtifactFingerprint(hasher.finish())
    }

    /// Eligible for the raw `DownloadChunk` branch (§4.5 branch 1):
    /// single-chunk, no transform at all.
    pub fn as_trivial_single_chunk(&self) -> Option<ChunkId> {
        match self {
            ArtifactKey::SingleChunk(id) => Some(*id),
            ArtifactKey::Composite { .. } => None,
        }
    }

    pub fn data_source_type(&self) -> Option<DataSourceType> {
        match self {
            ArtifactKey::SingleChunk(_) => None,
            ArtifactKey::Composite { data_source_type, .. } => Some(*data_source_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnode_api_types::EObjectType;

    #[test]
    fn equal_keys_produce_equal_fingerprints() {
        let id = ChunkId::new_random(EObjectType::Blob);
        let a = ArtifactKey::SingleChunk(id);
        let b = ArtifactKey::SingleChunk(id);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn composite_keys_differing_only_by_column_filter_are_distinct() {
        let spec = ChunkSpec {
            chunk_id: ChunkId::new_random(EObjectType::Blob),
            first_block: 0,
            block_count: 10,
        };
        let a = ArtifactKey::Composite {
            data_source_type: DataSourceType::Table,
            chunk_specs: vec![spec],
            schema: None,
            column_filter: Some(vec!["a".to_string()]),
            timestamp: None,
            format: ArtifactFormat::Json,
        };
        let b = ArtifactKey::Composite {
            column_filter: Some(vec!["b".to_string()]),
            ..a.clone()
        };
        assert_ne!(a, b);
    }

    #[test]
    fn single_chunk_key_is_the_only_trivial_branch() {
        let id = ChunkId::new_random(EObjectType::Blob);
        assert_eq!(ArtifactKey::SingleChunk(id).as_trivial_single_chunk(), Some(id));

        let composite = ArtifactKey::Composite {
            data_source_type: DataSourceType::File,
            chunk_specs: vec![],
            schema: None,
            column_filter: None,
            timestamp: None,
            format: ArtifactFormat::Raw,
        };
        assert_eq!(composite.as_trivial_single_chunk(), None);
    }
}
