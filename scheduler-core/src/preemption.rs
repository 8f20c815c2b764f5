//! Preemptible-job analysis (§4.9.1), the blocking-ancestor walk
//! (§4.9.2) and graceful preemption (§4.9.4).

use std::time::{Duration, Instant};

use cnode_api_types::{JobId, PreemptionStatus};

use scheduler_tree::{Tree, TreeIndex};

/// A running job split into the two sets §4.9.1 distinguishes:
/// unconditionally preemptible jobs may be taken by any operation that
/// needs the room; conditionally preemptible jobs may only be taken by
/// an operation that is itself more starved than the job's owner (so
/// preemption always moves the tree toward fairness, never away from
/// it).
#[derive(Debug, Default)]
pub struct PreemptibleJobs {
    pub unconditional: Vec<JobId>,
    pub conditional: Vec<JobId>,
}

/// Splits every job running on `node` into unconditional/conditional
/// preemptible sets for a `requester` operation trying to schedule at
/// `min_status` or above.
pub fn classify(tree: &Tree, node_jobs: &[(TreeIndex, JobId, PreemptionStatus)], requester: TreeIndex, min_status: PreemptionStatus) -> PreemptibleJobs {
    let mut result = PreemptibleJobs::default();
    let requester_index = tree.get(requester).scheduling_index;

    for &(owner, ref job_id, status) in node_jobs {
        if !status.at_least(min_status) {
            continue;
        }
        if owner == requester {
            continue;
        }
        let owner_element = tree.get(owner);
        if status == PreemptionStatus::Preemptible {
            // The owning operation has already received everything it's
            // entitled to (fairShare == demandShare): fair game for
            // anyone.
            result.unconditional.push(job_id.clone());
        } else if requester_index < owner_element.scheduling_index {
            // Only a more-starved requester may take an aggressively
            // preemptible job from a less-starved owner.
            result.conditional.push(job_id.clone());
        }
    }
    result
}

/// Walks from `victim_operation` up toward the root, stopping at (and
/// excluding) its lowest common ancestor with `requester`, looking for a
/// pool that is itself below its own fair share. Preempting a job under
/// such a pool would rob an already-starved subtree to feed another
/// subtree entirely, rather than restoring fairness between the two
/// operations directly in contention — §4.9.2 calls this ancestor
/// "blocking" and the preemption is skipped.
pub fn find_blocking_ancestor(tree: &Tree, victim_operation: TreeIndex, requester: TreeIndex) -> Option<TreeIndex> {
    let victim_chain = ancestors(tree, victim_operation);
    let requester_chain = ancestors(tree, requester);
    let lca = lowest_common_ancestor(&victim_chain, &requester_chain)?;

    for &ancestor in victim_chain.iter().skip(1) {
        if ancestor == lca {
            break;
        }
        if tree.get(ancestor).satisfaction_ratio() < 0.999 {
            return Some(ancestor);
        }
    }
    None
}

fn ancestors(tree: &Tree, mut index: TreeIndex) -> Vec<TreeIndex> {
    let mut chain = vec![index];
    while let Some(parent) = tree.get(index).parent {
        chain.push(parent);
        index = parent;
    }
    chain
}

fn lowest_common_ancestor(a: &[TreeIndex], b: &[TreeIndex]) -> Option<TreeIndex> {
    let b_set: std::collections::HashSet<TreeIndex> = b.iter().copied().collect();
    a.iter().copied().find(|candidate| b_set.contains(candidate))
}

/// What the caller should do about an already-selected victim job this
/// heartbeat. A `Normal`-mode job is simply killed: the victim selection
/// in §4.9.1/§4.9.3 already decided it should go, and nothing in the
/// spec asks the scheduler to wait before reclaiming its resources. A
/// `Graceful`-mode job instead goes through §4.9.4's independent
/// interrupt/grace-period dance — sent the interrupt the first time,
/// then only reclaimed once `grace_period` has passed without the job
/// exiting on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionAction {
    SendInterrupt,
    AwaitGrace,
    Kill,
}

pub fn next_preemption_action(
    preemption_mode: cnode_api_types::PreemptionMode,
    interrupted: bool,
    interrupted_at: Option<Instant>,
    grace_period: Duration,
) -> PreemptionAction {
    if preemption_mode == cnode_api_types::PreemptionMode::Normal {
        return PreemptionAction::Kill;
    }
    match (interrupted, interrupted_at) {
        (false, _) => PreemptionAction::SendInterrupt,
        (true, Some(at)) if at.elapsed() >= grace_period => PreemptionAction::Kill,
        (true, _) => PreemptionAction::AwaitGrace,
    }
}

/// §4.9.4 "graceful preemption": independent of the per-heartbeat
/// scheduling stages, every currently-preemptible `Graceful`-mode job
/// that hasn't yet been signalled gets its long interrupt timeout
/// started here, regardless of whether any operation is actively trying
/// to schedule against it this heartbeat. No replacement job is required
/// to land in the same heartbeat this runs in.
pub fn run_graceful_preemption_sweep(tree: &Tree, long_interrupt_timeout: Duration) -> Vec<JobId> {
    let mut signalled = Vec::new();
    for &index in tree.operation_index.values() {
        let element = tree.get(index);
        if !element.is_preemptible(1e-6) {
            continue;
        }
        let Some(state) = &element.operation_shared_state else {
            continue;
        };
        let mut guard = state.write().expect("operation state lock poisoned");
        for job in guard.jobs.values_mut() {
            if job.preemption_mode != cnode_api_types::PreemptionMode::Graceful || job.interrupted {
                continue;
            }
            job.interrupted = true;
            job.interrupted_at = Some(Instant::now());
            let _ = long_interrupt_timeout;
            signalled.push(job.id.clone());
        }
    }
    signalled
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnode_api_types::PreemptionMode;

    #[test]
    fn normal_mode_jobs_are_killed_immediately() {
        assert_eq!(
            next_preemption_action(PreemptionMode::Normal, false, None, Duration::from_secs(60)),
            PreemptionAction::Kill
        );
    }

    #[test]
    fn graceful_mode_jobs_progress_through_grace_period() {
        assert_eq!(
            next_preemption_action(PreemptionMode::Graceful, false, None, Duration::from_secs(1)),
            PreemptionAction::SendInterrupt
        );
        assert_eq!(
            next_preemption_action(PreemptionMode::Graceful, true, Some(Instant::now()), Duration::from_secs(60)),
            PreemptionAction::AwaitGrace
        );
        let long_ago = Instant::now() - Duration::from_secs(120);
        assert_eq!(
            next_preemption_action(PreemptionMode::Graceful, true, Some(long_ago), Duration::from_secs(60)),
            PreemptionAction::Kill
        );
    }

    struct NeverGrant;

    #[async_trait::async_trait]
    impl scheduler_tree::ControllerProxy for NeverGrant {
        async fn schedule_job(
            &self,
            _operation_id: &cnode_api_types::OperationId,
            _available: cnode_api_types::ResourceVector,
            _node_id: &cnode_api_types::NodeId,
            _timeout: Duration,
        ) -> Result<scheduler_tree::JobStartDescriptor, Vec<String>> {
            Err(vec!["not used".to_owned()])
        }
    }

    fn two_pool_tree() -> (Tree, TreeIndex, TreeIndex) {
        use scheduler_tree::{OperationConfig, PoolConfig, PoolsConfig, SchedulerTree};

        fn pool(id: &str) -> PoolConfig {
            PoolConfig {
                id: cnode_api_types::PoolId(id.to_owned()),
                parent: None,
                weight: 1.0,
                strong_guarantee: Default::default(),
                resource_limits: None,
                max_share_ratio: None,
                burst_ratio: 0.0,
                flow_ratio: 1.0,
                scheduling_tag_filter: Default::default(),
                allow_regular_preemption: true,
                allow_aggressive_preemption: false,
                max_running_operation_count: None,
                max_operation_count: None,
            }
        }

        let cfg = PoolsConfig { pools: vec![pool("a"), pool("b")] };
        let scheduler = SchedulerTree::from_config(&cfg).unwrap();
        for (op_id, pool_id) in [("victim", "a"), ("requester", "b")] {
            scheduler
                .register_operation(OperationConfig {
                    id: cnode_api_types::OperationId(op_id.to_owned()),
                    pool: cnode_api_types::PoolId(pool_id.to_owned()),
                    weight: 1.0,
                    strong_guarantee: Default::default(),
                    resource_limits: None,
                    scheduling_tag_filter: Default::default(),
                    scheduling_segment: cnode_api_types::SchedulingSegment::default_segment(),
                    controller: std::sync::Arc::new(NeverGrant),
                })
                .unwrap();
        }

        let tree = (*scheduler.snapshot()).clone();
        let victim = *tree.operation_index.get(&cnode_api_types::OperationId("victim".to_owned())).unwrap();
        let requester = *tree.operation_index.get(&cnode_api_types::OperationId("requester".to_owned())).unwrap();
        (tree, victim, requester)
    }

    #[test]
    fn find_blocking_ancestor_ignores_the_victim_operations_own_ratio() {
        let (mut tree, victim, requester) = two_pool_tree();

        // The victim operation itself is far below its own demand share,
        // but its parent pool is fully satisfied (still at the default
        // zero fair/demand share) -- only an ancestor *pool*'s ratio
        // should ever block a preemption.
        tree.elements[victim].fair_share = cnode_api_types::ResourceVector { cpu: 1.0, ..Default::default() };
        tree.elements[victim].demand_share = cnode_api_types::ResourceVector { cpu: 10.0, ..Default::default() };

        assert_eq!(find_blocking_ancestor(&tree, victim, requester), None);
    }

    #[test]
    fn find_blocking_ancestor_stops_at_an_unsatisfied_pool() {
        let (mut tree, victim, requester) = two_pool_tree();

        let pool_a = tree.elements[victim].parent.unwrap();
        tree.elements[pool_a].fair_share = cnode_api_types::ResourceVector { cpu: 1.0, ..Default::default() };
        tree.elements[pool_a].demand_share = cnode_api_types::ResourceVector { cpu: 10.0, ..Default::default() };

        assert_eq!(find_blocking_ancestor(&tree, victim, requester), Some(pool_a));
    }
}
