//! Wire DTOs for the data-node RPC surface (§6). No transport is
//! implemented here (out of scope per spec.md's non-goals) — these are the
//! request/response shapes a transport would serialize, kept as plain
//! serde structs the way `pbs_api_types` keeps its API types independent
//! of the HTTP layer that eventually carries them.

use serde::{Deserialize, Serialize};

use crate::chunk_id::ChunkId;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionId(pub ChunkId);

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StartChunkOptions {
    pub medium_name: Option<String>,
    pub enable_caching: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkInfo {
    pub id: ChunkId,
    pub disk_space: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttachedBlock {
    pub index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeDescriptor {
    pub node_id: crate::scheduling::NodeId,
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GetBlockOptions {
    pub populate_cache: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GetMetaOptions {
    pub partition_tag: Option<u32>,
    pub extension_tags: Option<Vec<u32>>,
}
