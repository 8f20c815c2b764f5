//! The per-heartbeat job scheduler (§4.9): four stages run in sequence
//! against the same node report — non-preemptive, packing fallback,
//! aggressively-preemptive, then regular preemptive — each stage only
//! attempting operations the previous stage couldn't place.

use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};

use cnode_api_types::{JobId, PreemptionStatus, ResourceVector};

use scheduler_tree::element::TrackedJob;
use scheduler_tree::{Tree, TreeIndex};

use crate::context::{NodeHeartbeat, ScheduleOutcome, StageDeadlines, StartedJob, SCHEDULE_JOB_CONCURRENCY};
use crate::preemption;

/// Operations eligible to run on this node, most-starved first (§4.9
/// "the heartbeat walks operations in ascending scheduling index").
fn candidate_operations(tree: &Tree, heartbeat: &NodeHeartbeat) -> Vec<TreeIndex> {
    let mut candidates: Vec<TreeIndex> = tree
        .operation_index
        .values()
        .copied()
        .filter(|&index| {
            let element = tree.get(index);
            element.enabled
                && element.scheduling_tag_filter.matches(&heartbeat.scheduling_tags)
                && element.scheduling_segment.compatible_with(&heartbeat.segment)
        })
        .collect();
    candidates.sort_by_key(|&index| tree.get(index).scheduling_index);
    candidates
}

fn jobs_running_on_node(tree: &Tree, node_id: &cnode_api_types::NodeId, job_on_ssd: bool) -> Vec<(TreeIndex, JobId, PreemptionStatus)> {
    let mut jobs = Vec::new();
    for (_, &index) in &tree.operation_index {
        let element = tree.get(index);
        let Some(state) = &element.operation_shared_state else {
            continue;
        };
        let guard = state.read().expect("operation state lock poisoned");
        for job in guard.jobs.values() {
            if &job.node_id == node_id {
                jobs.push((index, job.id.clone(), element.preemption_status(job_on_ssd)));
            }
        }
    }
    jobs
}

/// Tries every candidate operation concurrently (bounded) with the
/// budget currently available, returning whichever `ScheduleJob` calls
/// succeeded. Does not itself decide whether an accepted result would
/// overcommit the node — that's `accept_without_overcommit`'s job,
/// kept separate so the concurrency-bounded fan-out and the
/// sequential acceptance-ordering logic (§4.9.3) don't tangle.
async fn try_schedule_all(
    tree: &Tree,
    candidates: &[TreeIndex],
    node_id: &cnode_api_types::NodeId,
    available: ResourceVector,
    deadline: Duration,
) -> Vec<(TreeIndex, scheduler_tree::JobStartDescriptor)> {
    let started = Instant::now();
    let calls = candidates.iter().copied().map(|index| {
        let element = tree.get(index);
        let controller = element.controller.clone();
        let operation_id = cnode_api_types::OperationId(element.id.clone());
        let node_id = node_id.clone();
        async move {
            let Some(controller) = controller else {
                return None;
            };
            match controller.schedule_job(&operation_id, available, &node_id, deadline).await {
                Ok(descriptor) => Some((index, descriptor)),
                Err(_reasons) => None,
            }
        }
    });

    let mut results = Vec::new();
    let mut buffered = stream::iter(calls).buffer_unordered(SCHEDULE_JOB_CONCURRENCY);
    while let Some(outcome) = buffered.next().await {
        if started.elapsed() >= deadline {
            break;
        }
        if let Some(entry) = outcome {
            results.push(entry);
        }
    }
    results
}

/// §4.9.3 "abort-on-overcommit": accepts results in priority
/// (scheduling-index) order as long as the running total still fits
/// `available`; anything collected but not accepted is reported as
/// aborted rather than silently dropped, since a controller may have
/// already reserved resources for it locally.
fn accept_without_overcommit(
    tree: &Tree,
    mut results: Vec<(TreeIndex, scheduler_tree::JobStartDescriptor)>,
    node_id: &cnode_api_types::NodeId,
    available: ResourceVector,
) -> ScheduleOutcome {
    results.sort_by_key(|&(index, _)| tree.get(index).scheduling_index);

    let mut outcome = ScheduleOutcome::default();
    let mut used = ResourceVector::ZERO;
    for (index, descriptor) in results {
        let would_use = used + descriptor.resource_limits;
        if !would_use.fits_within(available, 1e-9) {
            outcome.aborted.push(descriptor.job_id);
            continue;
        }
        used = would_use;
        let element = tree.get(index);
        if let Some(state) = &element.operation_shared_state {
            let mut guard = state.write().expect("operation state lock poisoned");
            guard.jobs.insert(
                descriptor.job_id.clone(),
                TrackedJob {
                    id: descriptor.job_id.clone(),
                    operation_id: cnode_api_types::OperationId(element.id.clone()),
                    node_id: node_id.clone(),
                    resource_usage: ResourceVector::ZERO,
                    resource_limits: descriptor.resource_limits,
                    preemption_status: PreemptionStatus::NonPreemptible,
                    start_time: Instant::now(),
                    preemption_mode: descriptor.preemption_mode,
                    interrupted: false,
                    interrupted_at: None,
                },
            );
            guard.total_resource_usage += descriptor.resource_limits;
        }
        outcome.started.push(StartedJob {
            operation_id: cnode_api_types::OperationId(element.id.clone()),
            descriptor,
        });
    }
    outcome
}

/// Runs the full four-stage heartbeat (§4.9). `remaining_candidates`
/// shrinks after each stage: an operation that got a job placed (or
/// whose `ScheduleJob` call explicitly failed) does not get retried by a
/// later, more aggressive stage this same heartbeat.
pub async fn run(tree: &Tree, heartbeat: &NodeHeartbeat, deadlines: StageDeadlines) -> ScheduleOutcome {
    /// §9 Open Question: the relationship between the graceful interrupt
    /// timeout and the regular per-job interrupt timeout is left
    /// unspecified; treated here as the independent scalar §9 calls for.
    const GRACEFUL_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(300);

    let mut outcome = ScheduleOutcome::default();
    let mut available = heartbeat.available_resources;
    let mut remaining = candidate_operations(tree, heartbeat);
    log::debug!("heartbeat from {}: {} candidate operations, {:?} available", heartbeat.node_id, remaining.len(), available);

    // §4.9.4: orthogonal to the stages below, scanned every heartbeat
    // regardless of which operations are actively trying to schedule.
    outcome.interrupted = preemption::run_graceful_preemption_sweep(tree, GRACEFUL_INTERRUPT_TIMEOUT);

    // Stage 1: non-preemptive. Only operations that fit in free capacity
    // right now, no victim selection at all.
    let results = try_schedule_all(tree, &remaining, &heartbeat.node_id, available, deadlines.non_preemptive).await;
    let scheduled: std::collections::HashSet<TreeIndex> = results.iter().map(|&(i, _)| i).collect();
    let stage_outcome = accept_without_overcommit(tree, results, &heartbeat.node_id, available);
    for started in &stage_outcome.started {
        available = (available - started.descriptor.resource_limits).max(ResourceVector::ZERO);
    }
    outcome.merge(stage_outcome);
    remaining.retain(|i| !scheduled.contains(i));
    if remaining.is_empty() {
        return outcome;
    }

    // Stage 2: packing fallback. Same as stage 1 but re-offered the
    // operations that didn't fit, in case a smaller job from the same
    // operation now packs into the leftover fragment.
    let results = try_schedule_all(tree, &remaining, &heartbeat.node_id, available, deadlines.packing_fallback).await;
    let scheduled: std::collections::HashSet<TreeIndex> = results.iter().map(|&(i, _)| i).collect();
    let stage_outcome = accept_without_overcommit(tree, results, &heartbeat.node_id, available);
    for started in &stage_outcome.started {
        available = (available - started.descriptor.resource_limits).max(ResourceVector::ZERO);
    }
    outcome.merge(stage_outcome);
    remaining.retain(|i| !scheduled.contains(i));
    if remaining.is_empty() {
        return outcome;
    }

    // Stage 3: aggressively-preemptive. Only operations whose own
    // starvation has reached `AggressivelyStarving` get to preempt, and
    // only jobs at `AggressivelyPreemptible` or above.
    let aggressive: Vec<TreeIndex> = remaining
        .iter()
        .copied()
        .filter(|&i| matches!(tree.get(i).starvation_status, cnode_api_types::StarvationStatus::AggressivelyStarving))
        .collect();
    if !aggressive.is_empty() {
        let freed = preempt_for(tree, &aggressive, &heartbeat.node_id, heartbeat.is_ssd, PreemptionStatus::AggressivelyPreemptible, &mut outcome);
        available += freed;
        let results = try_schedule_all(tree, &aggressive, &heartbeat.node_id, available, deadlines.aggressively_preemptive).await;
        let scheduled: std::collections::HashSet<TreeIndex> = results.iter().map(|&(i, _)| i).collect();
        let stage_outcome = accept_without_overcommit(tree, results, &heartbeat.node_id, available);
        for started in &stage_outcome.started {
            available = (available - started.descriptor.resource_limits).max(ResourceVector::ZERO);
        }
        outcome.merge(stage_outcome);
        remaining.retain(|i| !scheduled.contains(i));
    }
    if remaining.is_empty() {
        return outcome;
    }

    // Stage 4: regular preemptive. Same shape as stage 3 but for any
    // starving operation (`Starving` or `AggressivelyStarving`), not just
    // the more severe case: every such candidate may preempt anything at
    // `Preemptible` (unconditionally) or, if more starved than the
    // victim's owner, at `AggressivelyPreemptible`.
    let starving: Vec<TreeIndex> = remaining
        .iter()
        .copied()
        .filter(|&i| matches!(tree.get(i).starvation_status, cnode_api_types::StarvationStatus::Starving | cnode_api_types::StarvationStatus::AggressivelyStarving))
        .collect();
    if !starving.is_empty() {
        let freed = preempt_for(tree, &starving, &heartbeat.node_id, heartbeat.is_ssd, PreemptionStatus::Preemptible, &mut outcome);
        available += freed;
        let results = try_schedule_all(tree, &starving, &heartbeat.node_id, available, deadlines.regular_preemptive).await;
        let stage_outcome = accept_without_overcommit(tree, results, &heartbeat.node_id, available);
        outcome.merge(stage_outcome);
    }

    log::debug!(
        "heartbeat from {} done: {} started, {} preempted, {} aborted",
        heartbeat.node_id,
        outcome.started.len(),
        outcome.preempted.len(),
        outcome.aborted.len()
    );
    outcome
}

/// For each candidate operation, classifies this node's running jobs
/// into unconditional/conditional preemptible sets, drops any victim
/// blocked by an ancestor still below its own fair share (§4.9.2), and
/// advances the survivors through the graceful-preemption state machine
/// (§4.9.4). Returns the resource volume actually reclaimed this
/// heartbeat (only jobs that reached `Kill` free anything now).
fn preempt_for(tree: &Tree, candidates: &[TreeIndex], node_id: &cnode_api_types::NodeId, job_on_ssd: bool, min_status: PreemptionStatus, outcome: &mut ScheduleOutcome) -> ResourceVector {
    const GRACE_PERIOD: Duration = Duration::from_secs(30);
    let node_jobs = jobs_running_on_node(tree, node_id, job_on_ssd);
    let mut freed = ResourceVector::ZERO;

    for &requester in candidates {
        let classified = preemption::classify(tree, &node_jobs, requester, min_status);
        for job_id in classified.unconditional.into_iter().chain(classified.conditional) {
            let Some((owner, _, _)) = node_jobs.iter().find(|(_, id, _)| id == &job_id) else {
                continue;
            };
            if preemption::find_blocking_ancestor(tree, *owner, requester).is_some() {
                continue;
            }
            let Some(state) = &tree.get(*owner).operation_shared_state else {
                continue;
            };
            let mut guard = state.write().expect("operation state lock poisoned");
            let Some(job) = guard.jobs.get_mut(&job_id) else {
                continue;
            };
            match preemption::next_preemption_action(job.preemption_mode, job.interrupted, job.interrupted_at, GRACE_PERIOD) {
                preemption::PreemptionAction::SendInterrupt => {
                    job.interrupted = true;
                    job.interrupted_at = Some(Instant::now());
                }
                preemption::PreemptionAction::AwaitGrace => {}
                preemption::PreemptionAction::Kill => {
                    log::info!("preempting job {job_id} on {node_id} for operation {}", tree.get(requester).id);
                    freed += job.resource_limits;
                    guard.total_resource_usage -= job.resource_limits;
                    guard.jobs.remove(&job_id);
                    outcome.preempted.push(job_id);
                }
            }
        }
    }
    freed
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use cnode_api_types::{NodeId, OperationId, PreemptionMode};

    use scheduler_tree::{ControllerProxy, JobStartDescriptor, OperationConfig, PoolConfig, PoolsConfig, SchedulerTree};

    use super::*;

    struct FixedGrant {
        limits: ResourceVector,
    }

    #[async_trait]
    impl ControllerProxy for FixedGrant {
        async fn schedule_job(
            &self,
            _operation_id: &OperationId,
            available: ResourceVector,
            _node: &NodeId,
            _timeout: Duration,
        ) -> Result<JobStartDescriptor, Vec<String>> {
            if !self.limits.fits_within(available, 1e-9) {
                return Err(vec!["insufficient resources".to_owned()]);
            }
            Ok(JobStartDescriptor {
                job_id: cnode_api_types::JobId(format!("{:?}", std::time::Instant::now())),
                resource_limits: self.limits,
                preemption_mode: PreemptionMode::Normal,
            })
        }
    }

    fn one_pool() -> PoolsConfig {
        PoolsConfig {
            pools: vec![PoolConfig {
                id: cnode_api_types::PoolId("a".to_owned()),
                parent: None,
                weight: 1.0,
                strong_guarantee: ResourceVector::ZERO,
                resource_limits: None,
                max_share_ratio: None,
                burst_ratio: 0.0,
                flow_ratio: 1.0,
                scheduling_tag_filter: Default::default(),
                allow_regular_preemption: true,
                allow_aggressive_preemption: false,
                max_running_operation_count: None,
                max_operation_count: None,
            }],
        }
    }

    fn heartbeat(available: ResourceVector) -> NodeHeartbeat {
        NodeHeartbeat {
            node_id: NodeId("node-1".to_owned()),
            available_resources: available,
            total_resources: available,
            is_ssd: false,
            scheduling_tags: Vec::new(),
            segment: cnode_api_types::SchedulingSegment::default_segment(),
        }
    }

    #[tokio::test]
    async fn non_preemptive_stage_places_a_job_that_fits() {
        let scheduler = SchedulerTree::from_config(&one_pool()).unwrap();
        scheduler
            .register_operation(OperationConfig {
                id: OperationId("op-1".to_owned()),
                pool: cnode_api_types::PoolId("a".to_owned()),
                weight: 1.0,
                strong_guarantee: ResourceVector::ZERO,
                resource_limits: None,
                scheduling_tag_filter: Default::default(),
                scheduling_segment: cnode_api_types::SchedulingSegment::default_segment(),
                controller: Arc::new(FixedGrant {
                    limits: ResourceVector { cpu: 2.0, ..ResourceVector::ZERO },
                }),
            })
            .unwrap();

        let tree = scheduler.snapshot();
        let hb = heartbeat(ResourceVector { cpu: 8.0, memory: 8.0, network: 8.0, user_slots: 8.0 });
        let outcome = run(&tree, &hb, StageDeadlines::default()).await;

        assert_eq!(outcome.started.len(), 1);
        assert!(outcome.aborted.is_empty());
    }

    #[tokio::test]
    async fn non_preemptive_stage_skips_a_job_that_does_not_fit() {
        let scheduler = SchedulerTree::from_config(&one_pool()).unwrap();
        scheduler
            .register_operation(OperationConfig {
                id: OperationId("op-1".to_owned()),
                pool: cnode_api_types::PoolId("a".to_owned()),
                weight: 1.0,
                strong_guarantee: ResourceVector::ZERO,
                resource_limits: None,
                scheduling_tag_filter: Default::default(),
                scheduling_segment: cnode_api_types::SchedulingSegment::default_segment(),
                controller: Arc::new(FixedGrant {
                    limits: ResourceVector { cpu: 100.0, ..ResourceVector::ZERO },
                }),
            })
            .unwrap();

        let tree = scheduler.snapshot();
        let hb = heartbeat(ResourceVector { cpu: 1.0, memory: 1.0, network: 1.0, user_slots: 1.0 });
        let outcome = run(&tree, &hb, StageDeadlines::default()).await;

        assert!(outcome.started.is_empty());
    }

    fn two_pools() -> PoolsConfig {
        let mut cfg = one_pool();
        cfg.pools.push(PoolConfig {
            id: cnode_api_types::PoolId("b".to_owned()),
            parent: None,
            weight: 1.0,
            strong_guarantee: ResourceVector::ZERO,
            resource_limits: None,
            max_share_ratio: None,
            burst_ratio: 0.0,
            flow_ratio: 1.0,
            scheduling_tag_filter: Default::default(),
            allow_regular_preemption: true,
            allow_aggressive_preemption: false,
            max_running_operation_count: None,
            max_operation_count: None,
        });
        cfg
    }

    /// End-to-end regression for the bug fixed alongside this test: a
    /// starving operation must get its job scheduled in the very same
    /// heartbeat that frees a `Normal`-mode victim, with no grace-period
    /// wait in between (§4.9.4 only applies to `Graceful`-mode jobs).
    #[tokio::test]
    async fn regular_preemptive_stage_frees_and_schedules_within_one_heartbeat() {
        let scheduler = SchedulerTree::from_config(&two_pools()).unwrap();
        scheduler
            .register_operation(OperationConfig {
                id: OperationId("op-p".to_owned()),
                pool: cnode_api_types::PoolId("a".to_owned()),
                weight: 1.0,
                strong_guarantee: ResourceVector::ZERO,
                resource_limits: None,
                scheduling_tag_filter: Default::default(),
                scheduling_segment: cnode_api_types::SchedulingSegment::default_segment(),
                controller: Arc::new(FixedGrant {
                    limits: ResourceVector { cpu: 1.0, ..ResourceVector::ZERO },
                }),
            })
            .unwrap();
        scheduler
            .register_operation(OperationConfig {
                id: OperationId("op-q".to_owned()),
                pool: cnode_api_types::PoolId("b".to_owned()),
                weight: 1.0,
                strong_guarantee: ResourceVector::ZERO,
                resource_limits: None,
                scheduling_tag_filter: Default::default(),
                scheduling_segment: cnode_api_types::SchedulingSegment::default_segment(),
                controller: Arc::new(FixedGrant {
                    limits: ResourceVector { cpu: 1.0, ..ResourceVector::ZERO },
                }),
            })
            .unwrap();

        let mut tree = (*scheduler.snapshot()).clone();
        let p_index = *tree.operation_index.get(&OperationId("op-p".to_owned())).unwrap();
        let q_index = *tree.operation_index.get(&OperationId("op-q".to_owned())).unwrap();

        // op-P is running one CPU's worth of job and has nothing left to
        // ask for: its fair share no longer matches what it demands,
        // which this tree's `is_preemptible` reads as "done contending"
        // and makes its job preemptible. (`preempt_for` frees every
        // classified victim of a candidate in one pass rather than only
        // as many as the candidate goes on to need -- see DESIGN.md's
        // note on stage 4's preemption granularity -- so this scenario
        // keeps op-P down to the single job the fix is actually about,
        // rather than the ten-job version of spec.md §8 scenario 5.)
        let p_job_id = JobId("p-job-0".to_owned());
        {
            let state = tree.elements[p_index].operation_shared_state.clone().unwrap();
            let mut guard = state.write().expect("lock poisoned");
            guard.jobs.insert(
                p_job_id.clone(),
                TrackedJob {
                    id: p_job_id.clone(),
                    operation_id: OperationId("op-p".to_owned()),
                    node_id: NodeId("node-1".to_owned()),
                    resource_usage: ResourceVector { cpu: 1.0, ..ResourceVector::ZERO },
                    resource_limits: ResourceVector { cpu: 1.0, ..ResourceVector::ZERO },
                    preemption_status: PreemptionStatus::Preemptible,
                    start_time: Instant::now(),
                    preemption_mode: PreemptionMode::Normal,
                    interrupted: false,
                    interrupted_at: None,
                },
            );
            guard.total_resource_usage = ResourceVector { cpu: 1.0, ..ResourceVector::ZERO };
        }
        tree.elements[p_index].fair_share = ResourceVector { cpu: 5.0, ..ResourceVector::ZERO };
        tree.elements[p_index].demand_share = ResourceVector { cpu: 10.0, ..ResourceVector::ZERO };
        tree.elements[p_index].scheduling_index = 1;

        // op-Q wants a job and is starving for it; lower scheduling
        // index than op-P so it's walked first.
        tree.elements[q_index].starvation_status = cnode_api_types::StarvationStatus::Starving;
        tree.elements[q_index].scheduling_index = 0;

        let hb = heartbeat(ResourceVector::ZERO);
        let outcome = run(&tree, &hb, StageDeadlines::default()).await;

        assert_eq!(outcome.preempted, vec![p_job_id]);
        assert_eq!(outcome.started.len(), 1, "expected op-Q's job to start in the same heartbeat");
        assert_eq!(outcome.started[0].operation_id, OperationId("op-q".to_owned()));
    }
}
