//! The per-heartbeat job scheduler (§4.9), built on top of the fair-share
//! snapshot [`scheduler_tree`] publishes. This crate owns nothing
//! persistent of its own: every mutation it makes (tracked jobs,
//! interrupt timestamps) lives inside the `OperationSharedState` the tree
//! already hands out per operation, so a fresh [`scheduler_tree::Tree`]
//! snapshot taken mid-heartbeat still sees jobs this crate just started.

pub mod context;
pub mod heartbeat;
pub mod preemption;

pub use context::{NodeHeartbeat, ScheduleOutcome, StageDeadlines, StartedJob, SCHEDULE_JOB_CONCURRENCY};
pub use heartbeat::run;
pub use preemption::{classify, find_blocking_ancestor, next_preemption_action, PreemptibleJobs, PreemptionAction};
