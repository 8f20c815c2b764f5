//! Persisted scheduler state (§6): one document per tree containing pool
//! integral-guarantee accumulators and per-node scheduling segments.
//! Reloaded verbatim at startup; unknown pools are dropped with a warning
//! (that drop happens in `scheduler-tree`, which owns the pools config to
//! check names against).
//!
//! The original system persists this as a YSON document. No crate in the
//! retrieval pack provides a YSON codec, so this is serialized with
//! `serde_json` instead — an explicit, documented substitution (see
//! DESIGN.md), not a silent one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::scheduling::{NodeId, PoolId, SchedulingSegment};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PoolPersistedState {
    pub accumulated_resource_volume: f64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeSchedulingSegmentState {
    pub segment: SchedulingSegment,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PersistedSchedulerState {
    pub pool_states: HashMap<PoolId, PoolPersistedState>,
    pub scheduling_segments_state: HashMap<NodeId, NodeSchedulingSegmentState>,
}
