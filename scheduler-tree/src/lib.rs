//! The fair-share scheduling tree: structure, the per-tick fair-share
//! update, and persisted scheduler state (§4.7, §4.8, §6).
//!
//! [`scheduler_core`](../scheduler_core/index.html) builds the
//! per-heartbeat job scheduler on top of the snapshot this crate
//! publishes; nothing in this crate dispatches jobs itself.

pub mod config;
pub mod element;
pub mod fair_share;
pub mod persisted_state;
pub mod tree;

pub use config::{OperationConfig, PoolConfig, PoolsConfig};
pub use element::{ControllerProxy, Element, ElementKind, JobStartDescriptor, OperationSharedState, SharedOperationState, TrackedJob, TreeIndex};
pub use tree::{OperationRuntimeInput, SchedulerTree, Tree, TreeError};
