//! The fair-share tree's node type (§3 "Fair-Share Element", §9 Design
//! Notes: "flatten [the] deep inheritance of scheduler element types ...
//! to a tagged variant `Element = Root | Pool | Operation` with a common
//! base-of-fields struct; polymorphic operations become a match on the
//! tag").
//!
//! The tree itself is an arena ([`crate::tree::Tree`]) of these nodes
//! indexed by [`TreeIndex`], replacing the source's intrusive
//! parent/child reference cycle per the same design note.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use cnode_api_types::{JobId, OperationId, PreemptionMode, PreemptionStatus, ResourceVector, SchedulingSegment, SchedulingTagFilter, StarvationStatus};

pub type TreeIndex = usize;

/// The remote capability a controller agent exposes for one operation
/// (§1, §6 `ScheduleJob`). No controller-side planning logic lives in
/// this workspace — this is the seam, mirroring
/// [`cnode_store::session::ReplicaTarget`] standing in for a socket this
/// repository never opens.
#[async_trait::async_trait]
pub trait ControllerProxy: Send + Sync {
    async fn schedule_job(
        &self,
        operation_id: &OperationId,
        available_resources: ResourceVector,
        node_id: &cnode_api_types::NodeId,
        timeout: std::time::Duration,
    ) -> Result<JobStartDescriptor, Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct JobStartDescriptor {
    pub job_id: JobId,
    pub resource_limits: ResourceVector,
    pub preemption_mode: PreemptionMode,
}

/// A job a node has reported running, tracked against the operation that
/// owns it (§3 "Job (tracked)").
#[derive(Debug, Clone)]
pub struct TrackedJob {
    pub id: JobId,
    pub operation_id: OperationId,
    pub node_id: cnode_api_types::NodeId,
    pub resource_usage: ResourceVector,
    pub resource_limits: ResourceVector,
    pub preemption_status: PreemptionStatus,
    pub start_time: Instant,
    pub preemption_mode: PreemptionMode,
    /// Set once a graceful-preemption interrupt signal has been sent
    /// (§4.9.4), so the sweep doesn't re-signal a job every heartbeat.
    pub interrupted: bool,
    /// When the interrupt signal was sent; once `grace_period` has
    /// elapsed since this, the job is eligible for a hard kill.
    pub interrupted_at: Option<Instant>,
}

/// An operation's shared, cross-node-shard mutable state (§3, §4.9,
/// §5: "mutated under a reader-writer lock so heartbeats on different
/// nodes touching the same operation serialise only on writes").
#[derive(Default)]
pub struct OperationSharedState {
    pub jobs: HashMap<JobId, TrackedJob>,
    pub total_resource_usage: ResourceVector,
}

pub type SharedOperationState = Arc<RwLock<OperationSharedState>>;

impl OperationSharedState {
    pub fn new() -> SharedOperationState {
        Arc::new(RwLock::new(Self::default()))
    }
}

/// Which concrete role a node plays; see the module doc for why this is
/// a tag on a uniform struct rather than a trait object hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Root,
    Pool,
    Operation,
}

/// A node in the fair-share tree. Field set is the union of what every
/// variant in spec.md §3 needs; fields meaningless for a given
/// [`ElementKind`] simply sit at their default (e.g. `children` is empty
/// for every `Operation`).
#[derive(Clone)]
pub struct Element {
    pub id: String,
    pub kind: ElementKind,
    pub tree_index: TreeIndex,
    pub parent: Option<TreeIndex>,
    /// Ordered enabled-then-disabled children (§3 "Composite elements
    /// ... hold ordered enabled/disabled children"); only `Root`/`Pool`
    /// populate this.
    pub children: Vec<TreeIndex>,
    pub enabled: bool,

    pub weight: f64,
    pub strong_guarantee: ResourceVector,
    pub resource_limits: Option<ResourceVector>,
    pub max_share_ratio: Option<f64>,
    pub burst_ratio: f64,
    pub flow_ratio: f64,
    pub scheduling_tag_filter: SchedulingTagFilter,
    pub allow_regular_preemption: bool,
    pub allow_aggressive_preemption: bool,
    pub max_running_operation_count: Option<usize>,
    pub max_operation_count: Option<usize>,

    /// Persistent attributes (§3), carried across ticks rather than
    /// recomputed from scratch: the integral-guarantee accumulator (a
    /// scalar dominant-share volume, matching
    /// [`cnode_api_types::persisted_state::PoolPersistedState`]'s shape)
    /// and the scheduling segment module an operation is pinned to.
    pub accumulated_resource_volume: f64,
    pub best_allocation_share: ResourceVector,
    pub scheduling_segment: SchedulingSegment,

    /// Aggregated bottom-up during the update tick (§4.7 step 3).
    pub demand: ResourceVector,
    pub max_possible_resource_usage: ResourceVector,
    pub resource_usage: ResourceVector,

    /// Computed top-down during the update tick (§4.8) and then read
    /// concurrently by every node shard until the next commit — these are
    /// the tree's "static attributes" (§3).
    pub fair_share: ResourceVector,
    pub demand_share: ResourceVector,
    pub starvation_status: StarvationStatus,
    pub below_fair_share_since: Option<Instant>,
    pub scheduling_index: u32,
    pub effective_aggressive_preemption_allowed: bool,
    pub are_regular_jobs_on_ssd_nodes_allowed: bool,

    /// `Some` only for `Operation`.
    pub controller: Option<Arc<dyn ControllerProxy>>,
    pub operation_shared_state: Option<SharedOperationState>,
    pub schedule_failure_count: u32,
    pub active_schedule_job_calls: u32,
}

impl Element {
    pub fn is_composite(&self) -> bool {
        matches!(self.kind, ElementKind::Root | ElementKind::Pool)
    }

    pub fn is_operation(&self) -> bool {
        matches!(self.kind, ElementKind::Operation)
    }

    /// `isPreemptible(op)` (§4.8 PostUpdate): "fairShare ≈ demandShare"
    /// means the operation is fully satisfied and ineligible to preempt.
    pub fn is_preemptible(&self, epsilon: f64) -> bool {
        !self.fair_share.fits_within(self.demand_share, epsilon) || !self.demand_share.fits_within(self.fair_share, epsilon)
    }

    /// Derives the preemption tier a job belonging to this operation
    /// currently sits at (§3, §4.9): unconditionally preemptible once
    /// the operation has everything it could use, aggressively
    /// preemptible if the operation (and every ancestor pool) still
    /// permits it, non-preemptible otherwise. `job_on_ssd` shifts the
    /// result to the paired SSD variant of the lattice (§4.9 "SSD
    /// overlays") since preempting SSD-resident jobs carries extra cost
    /// the scheduler weighs separately from the plain tiers.
    pub fn preemption_status(&self, job_on_ssd: bool) -> PreemptionStatus {
        if self.is_preemptible(1e-6) {
            return PreemptionStatus::Preemptible;
        }
        match (self.effective_aggressive_preemption_allowed, job_on_ssd) {
            (true, true) => PreemptionStatus::SsdAggressivelyPreemptible,
            (true, false) => PreemptionStatus::AggressivelyPreemptible,
            (false, true) => PreemptionStatus::SsdNonPreemptible,
            (false, false) => PreemptionStatus::NonPreemptible,
        }
    }

    /// `satisfactionRatio`-equivalent used by the starvation model (§4.8):
    /// the element's dominant fair-share dimension divided by its
    /// dominant demand-share dimension, saturating at 1.0 once demand is
    /// fully met.
    pub fn satisfaction_ratio(&self) -> f64 {
        let demand_dominant = self.demand_share.dominant_share(ResourceVector {
            cpu: 1.0,
            memory: 1.0,
            network: 1.0,
            user_slots: 1.0,
        });
        if demand_dominant <= 0.0 {
            return 1.0;
        }
        let fair_dominant = self.fair_share.dominant_share(ResourceVector {
            cpu: 1.0,
            memory: 1.0,
            network: 1.0,
            user_slots: 1.0,
        });
        (fair_dominant / demand_dominant).min(1.0)
    }
}
