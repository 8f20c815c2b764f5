//! Domain and wire types shared by every crate in the workspace: chunk
//! identity, the wire error taxonomy, resource vectors, scheduling
//! vocabulary, RPC DTOs and the persisted scheduler state document.

pub mod chunk_id;
pub mod error;
pub mod persisted_state;
pub mod resources;
pub mod rpc;
pub mod scheduling;

pub use chunk_id::{ChunkId, EObjectType};
pub use error::ClusterError;
pub use resources::ResourceVector;
pub use scheduling::{JobId, NodeId, OperationId, PoolId, PreemptionMode, PreemptionStatus};
