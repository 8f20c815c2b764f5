//! Top-down fair-share computation (§4.8): hierarchical dominant-resource
//! fair share, strong guarantees, integral (burst) guarantees and max
//! share, composed by per-dimension progressive filling ("water-filling",
//! the same max-min allocation TCP congestion control uses to split
//! bandwidth among competing flows — chosen here over full vector-DRF
//! equalization because it is tractable to implement and test
//! deterministically without a solver; see DESIGN.md for the tradeoff).

use std::collections::HashMap;
use std::time::Duration;

use cnode_api_types::ResourceVector;

use crate::element::TreeIndex;
use crate::tree::Tree;

/// How long a pool can bank under-use before the integral-guarantee
/// accumulator saturates (§4.8 "integral guarantees"); caps unbounded
/// growth from a pool that is idle for days.
const MAX_ACCUMULATED_SECONDS: f64 = 3600.0;

pub fn compute(tree: &mut Tree, total_resources: ResourceVector, dt: Duration) {
    let root = tree.root;
    tree.elements[root].fair_share = total_resources;
    tree.elements[root].demand_share = total_resources.min(tree.elements[root].demand);
    distribute(tree, root, total_resources);
    update_accumulators(tree, total_resources, dt);
}

/// Splits `budget` among `parent`'s enabled children and recurses.
fn distribute(tree: &mut Tree, parent: TreeIndex, budget: ResourceVector) {
    let children: Vec<TreeIndex> = tree.elements[parent].children.iter().copied().filter(|&c| tree.elements[c].enabled).collect();
    if children.is_empty() {
        return;
    }

    for dim in Dimension::ALL {
        let dim_budget = dim.get(budget);

        // Strong guarantees come off the top, clipped so they never
        // exceed what's actually available.
        let mut floors: HashMap<TreeIndex, f64> = HashMap::new();
        let mut floor_total = 0.0f64;
        for &child in &children {
            let guarantee = dim.get(tree.elements[child].strong_guarantee).min(dim.get(tree.elements[child].demand));
            floors.insert(child, guarantee);
            floor_total += guarantee;
        }
        if floor_total > dim_budget && floor_total > 0.0 {
            let scale = dim_budget / floor_total;
            for v in floors.values_mut() {
                *v *= scale;
            }
            floor_total = dim_budget;
        }
        let remaining = (dim_budget - floor_total).max(0.0);

        let items: Vec<(TreeIndex, f64, f64)> = children
            .iter()
            .map(|&child| {
                let element = &tree.elements[child];
                let floor = floors[&child];
                let residual_demand = (dim.get(element.demand) - floor).max(0.0);
                let capped_demand = match element.max_share_ratio {
                    Some(ratio) => residual_demand.min((ratio * dim_budget - floor).max(0.0)),
                    None => residual_demand,
                };
                (child, effective_weight(element), capped_demand)
            })
            .collect();
        let filled = water_fill(remaining, &items);

        for &child in &children {
            let share = floors[&child] + filled.get(&child).copied().unwrap_or(0.0);
            dim.set_fair_share(&mut tree.elements[child], share);
        }

        // demand_share: the same progressive filling but without the
        // max-share cap, used only to judge whether an operation is
        // fully satisfied (§4.8 `isPreemptible`).
        let uncapped_items: Vec<(TreeIndex, f64, f64)> = children
            .iter()
            .map(|&child| {
                let element = &tree.elements[child];
                let floor = floors[&child];
                (child, effective_weight(element), (dim.get(element.demand) - floor).max(0.0))
            })
            .collect();
        let uncapped_filled = water_fill(remaining, &uncapped_items);
        for &child in &children {
            let share = floors[&child] + uncapped_filled.get(&child).copied().unwrap_or(0.0);
            dim.set_demand_share(&mut tree.elements[child], share);
        }
    }

    for &child in &children {
        let child_budget = tree.elements[child].fair_share;
        if tree.elements[child].is_composite() {
            distribute(tree, child, child_budget);
        }
    }
}

/// A pool that is currently banking unused integral-guarantee volume
/// gets a temporary weight boost up to `1 + burst_ratio`, letting it
/// catch up on past under-use (§4.8 "burst ratio").
fn effective_weight(element: &crate::element::Element) -> f64 {
    if element.accumulated_resource_volume > 0.0 && element.burst_ratio > 0.0 {
        element.weight * (1.0 + element.burst_ratio)
    } else {
        element.weight
    }
}

/// Classic max-min weighted water-filling: give everyone their
/// weight-proportional share of `budget`, then repeatedly hand back
/// demand-capped participants' unused allocation to the rest until
/// nothing more can be redistributed.
fn water_fill(budget: f64, items: &[(TreeIndex, f64, f64)]) -> HashMap<TreeIndex, f64> {
    let mut result = HashMap::new();
    let mut active: Vec<(TreeIndex, f64, f64)> = items.iter().copied().filter(|&(_, weight, demand)| weight > 0.0 && demand > 0.0).collect();
    let mut remaining = budget;

    loop {
        if active.is_empty() || remaining <= 0.0 {
            break;
        }
        let weight_sum: f64 = active.iter().map(|&(_, w, _)| w).sum();
        if weight_sum <= 0.0 {
            break;
        }
        let mut satisfied_any = false;
        let mut still_active = Vec::new();
        for (index, weight, demand) in active {
            let proposed = remaining * weight / weight_sum;
            if proposed >= demand {
                result.insert(index, demand);
                remaining -= demand;
                satisfied_any = true;
            } else {
                still_active.push((index, weight, demand));
            }
        }
        active = still_active;
        if !satisfied_any {
            let weight_sum: f64 = active.iter().map(|&(_, w, _)| w).sum();
            for (index, weight, _) in &active {
                result.insert(*index, remaining * weight / weight_sum);
            }
            break;
        }
    }

    result
}

fn update_accumulators(tree: &mut Tree, total_resources: ResourceVector, dt: Duration) {
    let dt_secs = dt.as_secs_f64();
    if dt_secs <= 0.0 {
        return;
    }
    for element in &mut tree.elements {
        if matches!(element.kind, crate::element::ElementKind::Root) {
            continue;
        }
        let fair_dominant = element.fair_share.dominant_share(total_resources);
        let usage_dominant = element.resource_usage.dominant_share(total_resources);
        if usage_dominant + 1e-9 < fair_dominant {
            element.accumulated_resource_volume = (element.accumulated_resource_volume + element.flow_ratio * dt_secs).min(MAX_ACCUMULATED_SECONDS);
        } else if usage_dominant > fair_dominant {
            let overage = (usage_dominant - fair_dominant) * dt_secs;
            element.accumulated_resource_volume = (element.accumulated_resource_volume - overage).max(0.0);
        }
    }
}

#[derive(Clone, Copy)]
enum Dimension {
    Cpu,
    Memory,
    Network,
    UserSlots,
}

impl Dimension {
    const ALL: [Dimension; 4] = [Dimension::Cpu, Dimension::Memory, Dimension::Network, Dimension::UserSlots];

    fn get(self, v: ResourceVector) -> f64 {
        match self {
            Dimension::Cpu => v.cpu,
            Dimension::Memory => v.memory,
            Dimension::Network => v.network,
            Dimension::UserSlots => v.user_slots,
        }
    }

    fn set_fair_share(self, element: &mut crate::element::Element, value: f64) {
        match self {
            Dimension::Cpu => element.fair_share.cpu = value,
            Dimension::Memory => element.fair_share.memory = value,
            Dimension::Network => element.fair_share.network = value,
            Dimension::UserSlots => element.fair_share.user_slots = value,
        }
    }

    fn set_demand_share(self, element: &mut crate::element::Element, value: f64) {
        match self {
            Dimension::Cpu => element.demand_share.cpu = value,
            Dimension::Memory => element.demand_share.memory = value,
            Dimension::Network => element.demand_share.network = value,
            Dimension::UserSlots => element.demand_share.user_slots = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn water_fill_splits_evenly_under_unbounded_demand() {
        let items = vec![(0, 1.0, 100.0), (1, 1.0, 100.0)];
        let result = water_fill(10.0, &items);
        assert!((result[&0] - 5.0).abs() < 1e-9);
        assert!((result[&1] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn water_fill_hands_back_unused_share_to_others() {
        let items = vec![(0, 1.0, 1.0), (1, 1.0, 100.0)];
        let result = water_fill(10.0, &items);
        assert!((result[&0] - 1.0).abs() < 1e-9);
        assert!((result[&1] - 9.0).abs() < 1e-9);
    }

    #[test]
    fn water_fill_respects_weights() {
        let items = vec![(0, 1.0, 100.0), (1, 3.0, 100.0)];
        let result = water_fill(8.0, &items);
        assert!((result[&0] - 2.0).abs() < 1e-9);
        assert!((result[&1] - 6.0).abs() < 1e-9);
    }
}
