//! The tree arena and its single-writer/many-reader snapshot (§4.7).
//!
//! Per the Design Notes (§9), the source's intrusive, shared-ownership
//! parent/child graph is replaced here by a flat `Vec<Element>` arena
//! indexed by [`TreeIndex`]; a whole `Tree` is published atomically as an
//! `Arc` behind a `RwLock` so every node shard's heartbeat reads a
//! consistent snapshot without blocking the next fair-share tick's
//! writer. No `arc-swap`-style crate appears anywhere in the retrieval
//! pack, so `std::sync::RwLock<Arc<Tree>>` stands in for it — a read
//! lock held only long enough to clone the `Arc` is the idiom the
//! teacher uses for its own config-reload snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use cnode_api_types::{OperationId, PoolId, ResourceVector};

use crate::config::{OperationConfig, PoolsConfig};
use crate::element::{Element, ElementKind, TreeIndex};
use crate::fair_share;

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("pool {0} references unknown parent {1}")]
    UnknownParent(PoolId, PoolId),
    #[error("pool ids must be unique, duplicate: {0}")]
    DuplicatePool(PoolId),
    #[error("operation {0} references unknown pool {1}")]
    UnknownPool(OperationId, PoolId),
    #[error("operation id already registered: {0}")]
    DuplicateOperation(OperationId),
    #[error("no such operation: {0}")]
    NoSuchOperation(OperationId),
}

/// An immutable, fully-computed tree snapshot (§3).
#[derive(Clone)]
pub struct Tree {
    pub elements: Vec<Element>,
    pub root: TreeIndex,
    pub pool_index: HashMap<PoolId, TreeIndex>,
    pub operation_index: HashMap<OperationId, TreeIndex>,
}

impl Tree {
    pub fn get(&self, index: TreeIndex) -> &Element {
        &self.elements[index]
    }

    pub fn pool(&self, id: &PoolId) -> Option<&Element> {
        self.pool_index.get(id).map(|&i| &self.elements[i])
    }

    pub fn operation(&self, id: &OperationId) -> Option<&Element> {
        self.operation_index.get(id).map(|&i| &self.elements[i])
    }

    /// Post-order traversal (children before parent), used by the
    /// bottom-up aggregation step (§4.7 step 3).
    fn post_order(&self) -> Vec<TreeIndex> {
        let mut order = Vec::with_capacity(self.elements.len());
        fn visit(tree: &Tree, index: TreeIndex, order: &mut Vec<TreeIndex>) {
            for &child in &tree.elements[index].children {
                visit(tree, child, order);
            }
            order.push(index);
        }
        visit(self, self.root, &mut order);
        order
    }
}

/// Per-operation inputs reported by node heartbeats between update ticks
/// (§4.7 step 1 "PreUpdate"): how much the operation currently wants and
/// is using. Buffered here rather than written straight into the
/// published `Tree` since only the update tick's writer mutates the
/// arena.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationRuntimeInput {
    pub demand: ResourceVector,
    pub resource_usage: ResourceVector,
    pub max_possible_resource_usage: ResourceVector,
}

pub struct SchedulerTree {
    current: RwLock<Arc<Tree>>,
    pending: Mutex<HashMap<OperationId, OperationRuntimeInput>>,
    last_update: Mutex<Instant>,
}

impl SchedulerTree {
    pub fn from_config(config: &PoolsConfig) -> Result<Self, TreeError> {
        let tree = build_tree(config)?;
        Ok(SchedulerTree {
            current: RwLock::new(Arc::new(tree)),
            pending: Mutex::new(HashMap::new()),
            last_update: Mutex::new(Instant::now()),
        })
    }

    pub fn snapshot(&self) -> Arc<Tree> {
        self.current.read().expect("scheduler tree lock poisoned").clone()
    }

    /// §4.9 job tracking calls this every heartbeat to feed PreUpdate
    /// without waiting for the next fair-share tick.
    pub fn report_operation_usage(&self, operation_id: OperationId, input: OperationRuntimeInput) {
        self.pending.lock().expect("pending lock poisoned").insert(operation_id, input);
    }

    pub fn register_operation(&self, operation: OperationConfig) -> Result<(), TreeError> {
        let mut guard = self.current.write().expect("scheduler tree lock poisoned");
        let mut tree = (**guard).clone();
        if tree.operation_index.contains_key(&operation.id) {
            return Err(TreeError::DuplicateOperation(operation.id));
        }
        let parent = *tree
            .pool_index
            .get(&operation.pool)
            .ok_or_else(|| TreeError::UnknownPool(operation.id.clone(), operation.pool.clone()))?;
        let index = tree.elements.len();
        tree.elements.push(Element {
            id: operation.id.0.clone(),
            kind: ElementKind::Operation,
            tree_index: index,
            parent: Some(parent),
            children: Vec::new(),
            enabled: true,
            weight: operation.weight,
            strong_guarantee: operation.strong_guarantee,
            resource_limits: operation.resource_limits,
            max_share_ratio: None,
            burst_ratio: 0.0,
            flow_ratio: 1.0,
            scheduling_tag_filter: operation.scheduling_tag_filter,
            allow_regular_preemption: true,
            allow_aggressive_preemption: false,
            max_running_operation_count: None,
            max_operation_count: None,
            accumulated_resource_volume: 0.0,
            best_allocation_share: ResourceVector::ZERO,
            scheduling_segment: operation.scheduling_segment,
            demand: ResourceVector::ZERO,
            max_possible_resource_usage: ResourceVector::ZERO,
            resource_usage: ResourceVector::ZERO,
            fair_share: ResourceVector::ZERO,
            demand_share: ResourceVector::ZERO,
            starvation_status: cnode_api_types::StarvationStatus::Normal,
            below_fair_share_since: None,
            scheduling_index: 0,
            effective_aggressive_preemption_allowed: false,
            are_regular_jobs_on_ssd_nodes_allowed: false,
            controller: Some(operation.controller),
            operation_shared_state: Some(crate::element::OperationSharedState::new()),
            schedule_failure_count: 0,
            active_schedule_job_calls: 0,
        });
        tree.elements[parent].children.push(index);
        tree.operation_index.insert(operation.id, index);
        *guard = Arc::new(tree);
        Ok(())
    }

    /// Applies a loaded [`crate::persisted_state::PersistedSchedulerState`]
    /// to the current snapshot and publishes the result, so a restarted
    /// scheduler resumes with its pools' integral-guarantee accumulators
    /// intact instead of silently reverting to zero on the next tick.
    pub fn restore_persisted_state(&self, state: &cnode_api_types::persisted_state::PersistedSchedulerState) {
        let mut guard = self.current.write().expect("scheduler tree lock poisoned");
        let mut tree = (**guard).clone();
        crate::persisted_state::apply(&mut tree, state);
        *guard = Arc::new(tree);
    }

    pub fn unregister_operation(&self, id: &OperationId) -> Result<(), TreeError> {
        let mut guard = self.current.write().expect("scheduler tree lock poisoned");
        let mut tree = (**guard).clone();
        let index = tree.operation_index.remove(id).ok_or_else(|| TreeError::NoSuchOperation(id.clone()))?;
        if let Some(parent) = tree.elements[index].parent {
            tree.elements[parent].children.retain(|&c| c != index);
        }
        tree.elements[index].enabled = false;
        self.pending.lock().expect("pending lock poisoned").remove(id);
        *guard = Arc::new(tree);
        Ok(())
    }

    /// Runs one full fair-share update tick (§4.7): Clone, PreUpdate,
    /// bottom-up demand/usage aggregation, top-down fair-share
    /// computation, PostUpdate (starvation/preemptibility/scheduling
    /// index), then Commit. Returns the freshly published snapshot.
    pub fn update(&self, total_resources: ResourceVector) -> Arc<Tree> {
        let dt = {
            let mut last = self.last_update.lock().expect("last_update lock poisoned");
            let now = Instant::now();
            let dt = now.duration_since(*last);
            *last = now;
            dt
        };

        let mut tree = (**self.snapshot()).clone();

        // PreUpdate: drain pending heartbeat reports into their leaves.
        let pending = std::mem::take(&mut *self.pending.lock().expect("pending lock poisoned"));
        for (operation_id, input) in pending {
            if let Some(&index) = tree.operation_index.get(&operation_id) {
                let element = &mut tree.elements[index];
                element.demand = input.demand;
                element.resource_usage = input.resource_usage;
                element.max_possible_resource_usage = input.max_possible_resource_usage;
            }
        }

        bottom_up_aggregate(&mut tree);
        fair_share::compute(&mut tree, total_resources, dt);
        post_update(&mut tree, dt);

        let snapshot = Arc::new(tree);
        *self.current.write().expect("scheduler tree lock poisoned") = snapshot.clone();
        snapshot
    }
}

fn bottom_up_aggregate(tree: &mut Tree) {
    for index in tree.post_order() {
        if tree.elements[index].is_composite() {
            let children = tree.elements[index].children.clone();
            let mut demand = ResourceVector::ZERO;
            let mut usage = ResourceVector::ZERO;
            let mut max_possible = ResourceVector::ZERO;
            for child in children {
                let c = &tree.elements[child];
                if !c.enabled {
                    continue;
                }
                demand += c.demand;
                usage += c.resource_usage;
                max_possible += c.max_possible_resource_usage;
            }
            let element = &mut tree.elements[index];
            element.demand = demand;
            element.resource_usage = usage;
            element.max_possible_resource_usage = max_possible;
        }
    }
}

/// §4.8 PostUpdate: recompute starvation timers, preemptibility and the
/// heartbeat traversal order from the freshly published fair shares.
fn post_update(tree: &mut Tree, dt: Duration) {
    use cnode_api_types::StarvationStatus;

    const BELOW_FAIR_SHARE_TIMEOUT: Duration = Duration::from_secs(30);
    const STARVING_TIMEOUT: Duration = Duration::from_secs(120);

    // Ancestor index is always smaller than any descendant's (elements
    // are pushed in parent-before-child order at every mutation site),
    // so a single ascending pass is already parent-before-child.
    for index in 0..tree.elements.len() {
        let allowed = match tree.elements[index].parent {
            Some(parent) => tree.elements[index].allow_aggressive_preemption && tree.elements[parent].effective_aggressive_preemption_allowed,
            None => tree.elements[index].allow_aggressive_preemption,
        };
        tree.elements[index].effective_aggressive_preemption_allowed = allowed;
    }

    let now = Instant::now();
    for index in 0..tree.elements.len() {
        if !tree.elements[index].is_operation() {
            continue;
        }
        let satisfied = tree.elements[index].satisfaction_ratio() >= 0.999;
        let element = &mut tree.elements[index];
        if satisfied {
            element.below_fair_share_since = None;
            element.starvation_status = StarvationStatus::Normal;
            continue;
        }
        let since = *element.below_fair_share_since.get_or_insert(now);
        let elapsed = now.duration_since(since);
        element.starvation_status = if elapsed >= STARVING_TIMEOUT {
            StarvationStatus::AggressivelyStarving
        } else if elapsed >= BELOW_FAIR_SHARE_TIMEOUT {
            StarvationStatus::Starving
        } else {
            StarvationStatus::BelowFairShare
        };
    }

    // Scheduling index: operations ordered by ascending satisfaction
    // ratio, so the emptiest-relative-to-its-share operation is first in
    // every node's heartbeat sweep (§4.9).
    let mut operations: Vec<TreeIndex> = tree.operation_index.values().copied().collect();
    operations.sort_by(|&a, &b| {
        tree.elements[a]
            .satisfaction_ratio()
            .partial_cmp(&tree.elements[b].satisfaction_ratio())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for (rank, index) in operations.into_iter().enumerate() {
        tree.elements[index].scheduling_index = rank as u32;
    }
    let _ = dt;
}

fn build_tree(config: &PoolsConfig) -> Result<Tree, TreeError> {
    let mut elements = vec![Element {
        id: "root".to_owned(),
        kind: ElementKind::Root,
        tree_index: 0,
        parent: None,
        children: Vec::new(),
        enabled: true,
        weight: 1.0,
        strong_guarantee: ResourceVector::ZERO,
        resource_limits: None,
        max_share_ratio: None,
        burst_ratio: 0.0,
        flow_ratio: 1.0,
        scheduling_tag_filter: Default::default(),
        allow_regular_preemption: true,
        allow_aggressive_preemption: true,
        max_running_operation_count: None,
        max_operation_count: None,
        accumulated_resource_volume: 0.0,
        best_allocation_share: ResourceVector::ZERO,
        scheduling_segment: cnode_api_types::SchedulingSegment::default_segment(),
        demand: ResourceVector::ZERO,
        max_possible_resource_usage: ResourceVector::ZERO,
        resource_usage: ResourceVector::ZERO,
        fair_share: ResourceVector::ZERO,
        demand_share: ResourceVector::ZERO,
        starvation_status: cnode_api_types::StarvationStatus::Normal,
        below_fair_share_since: None,
        scheduling_index: 0,
        effective_aggressive_preemption_allowed: true,
        are_regular_jobs_on_ssd_nodes_allowed: true,
        controller: None,
        operation_shared_state: None,
        schedule_failure_count: 0,
        active_schedule_job_calls: 0,
    }];
    let mut pool_index = HashMap::new();
    pool_index.insert(PoolId("root".to_owned()), 0usize);

    for pool in config.topo_sorted().map_err(|dup| TreeError::UnknownParent(dup.clone(), dup))? {
        if pool_index.contains_key(&pool.id) {
            return Err(TreeError::DuplicatePool(pool.id.clone()));
        }
        let parent = match &pool.parent {
            Some(parent_id) => *pool_index.get(parent_id).ok_or_else(|| TreeError::UnknownParent(pool.id.clone(), parent_id.clone()))?,
            None => 0,
        };
        let index = elements.len();
        elements.push(Element {
            id: pool.id.0.clone(),
            kind: ElementKind::Pool,
            tree_index: index,
            parent: Some(parent),
            children: Vec::new(),
            enabled: true,
            weight: pool.weight,
            strong_guarantee: pool.strong_guarantee,
            resource_limits: pool.resource_limits,
            max_share_ratio: pool.max_share_ratio,
            burst_ratio: pool.burst_ratio,
            flow_ratio: pool.flow_ratio,
            scheduling_tag_filter: pool.scheduling_tag_filter.clone(),
            allow_regular_preemption: pool.allow_regular_preemption,
            allow_aggressive_preemption: pool.allow_aggressive_preemption,
            max_running_operation_count: pool.max_running_operation_count,
            max_operation_count: pool.max_operation_count,
            accumulated_resource_volume: 0.0,
            best_allocation_share: ResourceVector::ZERO,
            scheduling_segment: cnode_api_types::SchedulingSegment::default_segment(),
            demand: ResourceVector::ZERO,
            max_possible_resource_usage: ResourceVector::ZERO,
            resource_usage: ResourceVector::ZERO,
            fair_share: ResourceVector::ZERO,
            demand_share: ResourceVector::ZERO,
            starvation_status: cnode_api_types::StarvationStatus::Normal,
            below_fair_share_since: None,
            scheduling_index: 0,
            effective_aggressive_preemption_allowed: pool.allow_aggressive_preemption,
            are_regular_jobs_on_ssd_nodes_allowed: true,
            controller: None,
            operation_shared_state: None,
            schedule_failure_count: 0,
            active_schedule_job_calls: 0,
        });
        elements[parent].children.push(index);
        pool_index.insert(pool.id.clone(), index);
    }

    Ok(Tree {
        elements,
        root: 0,
        pool_index,
        operation_index: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use cnode_api_types::{NodeId, OperationId, PreemptionMode};

    use super::*;
    use crate::config::PoolConfig;
    use crate::element::{ControllerProxy, JobStartDescriptor};

    struct NeverSchedules;

    #[async_trait]
    impl ControllerProxy for NeverSchedules {
        async fn schedule_job(
            &self,
            _operation_id: &OperationId,
            _available: ResourceVector,
            _node: &NodeId,
            _timeout: Duration,
        ) -> Result<JobStartDescriptor, Vec<String>> {
            Err(vec!["no work".to_owned()])
        }
    }

    fn pools() -> PoolsConfig {
        PoolsConfig {
            pools: vec![
                PoolConfig {
                    id: PoolId("a".to_owned()),
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
                },
                PoolConfig {
                    id: PoolId("b".to_owned()),
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
                },
            ],
        }
    }

    #[test]
    fn builds_root_plus_configured_pools() {
        let tree = SchedulerTree::from_config(&pools()).unwrap();
        let snapshot = tree.snapshot();
        assert!(snapshot.pool(&PoolId("a".to_owned())).is_some());
        assert!(snapshot.pool(&PoolId("b".to_owned())).is_some());
        assert_eq!(snapshot.elements[snapshot.root].children.len(), 2);
    }

    #[test]
    fn register_and_unregister_operation_updates_snapshot() {
        let tree = SchedulerTree::from_config(&pools()).unwrap();
        let op_id = OperationId("op-1".to_owned());
        tree.register_operation(OperationConfig {
            id: op_id.clone(),
            pool: PoolId("a".to_owned()),
            weight: 1.0,
            strong_guarantee: ResourceVector::ZERO,
            resource_limits: None,
            scheduling_tag_filter: Default::default(),
            scheduling_segment: cnode_api_types::SchedulingSegment::default_segment(),
            controller: Arc::new(NeverSchedules),
        })
        .unwrap();

        let snapshot = tree.snapshot();
        assert!(snapshot.operation(&op_id).is_some());

        tree.unregister_operation(&op_id).unwrap();
        let snapshot = tree.snapshot();
        assert!(snapshot.operation(&op_id).is_none());
    }

    #[test]
    fn update_aggregates_demand_bottom_up() {
        let tree = SchedulerTree::from_config(&pools()).unwrap();
        let op_id = OperationId("op-1".to_owned());
        tree.register_operation(OperationConfig {
            id: op_id.clone(),
            pool: PoolId("a".to_owned()),
            weight: 1.0,
            strong_guarantee: ResourceVector::ZERO,
            resource_limits: None,
            scheduling_tag_filter: Default::default(),
            scheduling_segment: cnode_api_types::SchedulingSegment::default_segment(),
            controller: Arc::new(NeverSchedules),
        })
        .unwrap();
        tree.report_operation_usage(
            op_id.clone(),
            OperationRuntimeInput {
                demand: ResourceVector { cpu: 4.0, ..ResourceVector::ZERO },
                resource_usage: ResourceVector::ZERO,
                max_possible_resource_usage: ResourceVector { cpu: 4.0, ..ResourceVector::ZERO },
            },
        );

        let total = ResourceVector { cpu: 8.0, memory: 8.0, network: 8.0, user_slots: 8.0 };
        let snapshot = tree.update(total);
        let pool_a = snapshot.pool(&PoolId("a".to_owned())).unwrap();
        assert_eq!(pool_a.demand.cpu, 4.0);
    }

    #[test]
    fn restore_persisted_state_is_visible_through_snapshot() {
        use cnode_api_types::persisted_state::{PersistedSchedulerState, PoolPersistedState};

        let tree = SchedulerTree::from_config(&pools()).unwrap();
        let mut state = PersistedSchedulerState::default();
        state.pool_states.insert(PoolId("a".to_owned()), PoolPersistedState { accumulated_resource_volume: 42.0 });

        tree.restore_persisted_state(&state);

        let snapshot = tree.snapshot();
        assert_eq!(snapshot.pool(&PoolId("a".to_owned())).unwrap().accumulated_resource_volume, 42.0);
    }
}
