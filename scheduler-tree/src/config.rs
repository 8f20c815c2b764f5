//! Declarative configuration for the fair-share tree (§4.7 "Tree
//! construction"): the pools and their static attributes, loaded once at
//! startup and on every config reload, turned into a fresh [`crate::tree::Tree`]
//! by [`crate::tree::SchedulerTree::rebuild`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use cnode_api_types::{PoolId, ResourceVector, SchedulingTagFilter};

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// One pool's declared configuration. Root is implicit and is not
/// represented here; every `PoolConfig.parent == None` is a direct child
/// of the root.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    pub id: PoolId,
    pub parent: Option<PoolId>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub strong_guarantee: ResourceVector,
    #[serde(default)]
    pub resource_limits: Option<ResourceVector>,
    #[serde(default)]
    pub max_share_ratio: Option<f64>,
    #[serde(default)]
    pub burst_ratio: f64,
    #[serde(default = "default_weight")]
    pub flow_ratio: f64,
    #[serde(default)]
    pub scheduling_tag_filter: SchedulingTagFilter,
    #[serde(default = "default_true")]
    pub allow_regular_preemption: bool,
    #[serde(default)]
    pub allow_aggressive_preemption: bool,
    #[serde(default)]
    pub max_running_operation_count: Option<usize>,
    #[serde(default)]
    pub max_operation_count: Option<usize>,
}

/// An operation registered into the tree under a pool (§3 "Operation").
/// Unlike pools, operations come and go at runtime (submitted/completed)
/// rather than from static configuration, so this is the DTO
/// `SchedulerTree::register_operation` takes rather than something loaded
/// from disk alongside `PoolsConfig`.
#[derive(Clone)]
pub struct OperationConfig {
    pub id: cnode_api_types::OperationId,
    pub pool: PoolId,
    pub weight: f64,
    pub strong_guarantee: ResourceVector,
    pub resource_limits: Option<ResourceVector>,
    pub scheduling_tag_filter: SchedulingTagFilter,
    pub scheduling_segment: cnode_api_types::SchedulingSegment,
    pub controller: std::sync::Arc<dyn crate::element::ControllerProxy>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PoolsConfig {
    pub pools: Vec<PoolConfig>,
}

impl PoolsConfig {
    pub fn by_id(&self) -> HashMap<&PoolId, &PoolConfig> {
        self.pools.iter().map(|p| (&p.id, p)).collect()
    }

    /// Topologically sorted so that every pool appears after its parent;
    /// `Err` names the first pool whose ancestry doesn't resolve (missing
    /// or cyclic parent), which the tree build treats as a fatal config
    /// error rather than silently dropping the subtree.
    pub fn topo_sorted(&self) -> Result<Vec<&PoolConfig>, PoolId> {
        let by_id = self.by_id();
        let mut resolved: HashMap<&PoolId, bool> = HashMap::new();
        let mut order = Vec::with_capacity(self.pools.len());

        fn visit<'a>(
            pool: &'a PoolConfig,
            by_id: &HashMap<&'a PoolId, &'a PoolConfig>,
            resolved: &mut HashMap<&'a PoolId, bool>,
            order: &mut Vec<&'a PoolConfig>,
        ) -> Result<(), PoolId> {
            match resolved.get(&pool.id) {
                Some(true) => return Ok(()),
                Some(false) => return Err(pool.id.clone()),
                None => {}
            }
            resolved.insert(&pool.id, false);
            if let Some(parent_id) = &pool.parent {
                let parent = by_id.get(parent_id).ok_or_else(|| pool.id.clone())?;
                visit(parent, by_id, resolved, order)?;
            }
            resolved.insert(&pool.id, true);
            order.push(pool);
            Ok(())
        }

        for pool in &self.pools {
            visit(pool, &by_id, &mut resolved, &mut order)?;
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(id: &str, parent: Option<&str>) -> PoolConfig {
        PoolConfig {
            id: PoolId(id.to_owned()),
            parent: parent.map(|p| PoolId(p.to_owned())),
            weight: 1.0,
            strong_guarantee: ResourceVector::ZERO,
            resource_limits: None,
            max_share_ratio: None,
            burst_ratio: 0.0,
            flow_ratio: 1.0,
            scheduling_tag_filter: SchedulingTagFilter::default(),
            allow_regular_preemption: true,
            allow_aggressive_preemption: false,
            max_running_operation_count: None,
            max_operation_count: None,
        }
    }

    #[test]
    fn topo_sorted_orders_parents_first() {
        let cfg = PoolsConfig {
            pools: vec![pool("child", Some("parent")), pool("parent", None)],
        };
        let sorted = cfg.topo_sorted().unwrap();
        assert_eq!(sorted[0].id, PoolId("parent".to_owned()));
        assert_eq!(sorted[1].id, PoolId("child".to_owned()));
    }

    #[test]
    fn topo_sorted_rejects_missing_parent() {
        let cfg = PoolsConfig {
            pools: vec![pool("child", Some("ghost"))],
        };
        assert!(cfg.topo_sorted().is_err());
    }

    #[test]
    fn topo_sorted_rejects_cycle() {
        let cfg = PoolsConfig {
            pools: vec![pool("a", Some("b")), pool("b", Some("a"))],
        };
        assert!(cfg.topo_sorted().is_err());
    }
}
