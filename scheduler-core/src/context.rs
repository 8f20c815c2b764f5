//! Inputs and outputs of one heartbeat's scheduling pass (§4.9).

use std::time::Duration;

use cnode_api_types::{JobId, NodeId, OperationId, ResourceVector, SchedulingSegment};

use scheduler_tree::JobStartDescriptor;

/// What a node reports on each heartbeat: its free capacity and the
/// tags/segment the scheduler matches operations' filters against.
#[derive(Debug, Clone)]
pub struct NodeHeartbeat {
    pub node_id: NodeId,
    pub available_resources: ResourceVector,
    pub total_resources: ResourceVector,
    pub is_ssd: bool,
    pub scheduling_tags: Vec<String>,
    pub segment: SchedulingSegment,
}

/// Per-stage wall-clock budgets (§4.9 "each stage runs to completion or
/// its deadline, whichever comes first"). A stage that times out simply
/// stops admitting new `ScheduleJob` calls; results already in flight are
/// still awaited since a controller has no cancellation hook.
#[derive(Debug, Clone, Copy)]
pub struct StageDeadlines {
    pub non_preemptive: Duration,
    pub packing_fallback: Duration,
    pub aggressively_preemptive: Duration,
    pub regular_preemptive: Duration,
}

impl Default for StageDeadlines {
    fn default() -> Self {
        StageDeadlines {
            non_preemptive: Duration::from_millis(200),
            packing_fallback: Duration::from_millis(200),
            aggressively_preemptive: Duration::from_millis(300),
            regular_preemptive: Duration::from_millis(300),
        }
    }
}

/// Upper bound on concurrently in-flight `ScheduleJob` calls per stage
/// (§4.9 "bounded concurrency"), mirroring the teacher's
/// `try_buffer_unordered` idiom for pull-sync chunk downloads.
pub const SCHEDULE_JOB_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct StartedJob {
    pub operation_id: OperationId,
    pub descriptor: JobStartDescriptor,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOutcome {
    pub started: Vec<StartedJob>,
    pub preempted: Vec<JobId>,
    pub aborted: Vec<JobId>,
    /// Graceful-mode jobs signalled this heartbeat by the orthogonal
    /// §4.9.4 sweep. Distinct from `preempted`: an interrupted job keeps
    /// running (and keeps its resources reserved) until its grace period
    /// elapses, possibly several heartbeats later.
    pub interrupted: Vec<JobId>,
}

impl ScheduleOutcome {
    pub fn merge(&mut self, other: ScheduleOutcome) {
        self.started.extend(other.started);
        self.preempted.extend(other.preempted);
        self.aborted.extend(other.aborted);
        self.interrupted.extend(other.interrupted);
    }
}
