// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Pure placement policy over a snapshot of the resource view. Selection
//! never mutates manager state; callers acquire the chosen capacity
//! afterwards. Tie-breaks everywhere: highest remaining capacity after the
//! candidate placement, then lexicographically smallest node id.

use std::collections::HashMap;

use gcs_core::ids::NodeId;
use gcs_core::serde::protobuf::PlacementStrategy;

use crate::resource_manager::{NodeResources, ResourceSet};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulingResult {
    /// One node per demand, in demand order.
    Success(Vec<NodeId>),
    /// The demands cannot be satisfied against the current view.
    Infeasible,
}

/// Remaining capacity used for ranking: the sum of a node's available
/// quantities after the candidate demand is deducted.
fn remaining_capacity(node: &NodeResources, demand: &ResourceSet) -> f64 {
    node.available
        .iter()
        .map(|(name, available)| available - demand.get(name).copied().unwrap_or(0.0))
        .sum()
}

fn best_feasible_node(
    view: &HashMap<NodeId, NodeResources>,
    demand: &ResourceSet,
    exclude: impl Fn(&NodeId) -> bool,
) -> Option<NodeId> {
    let mut best: Option<(f64, NodeId)> = None;
    for (node_id, node) in view {
        if exclude(node_id) || !node.can_fit(demand) {
            continue;
        }
        let capacity = remaining_capacity(node, demand);
        best = match best {
            None => Some((capacity, *node_id)),
            Some((best_capacity, best_id)) => {
                if capacity > best_capacity
                    || (capacity == best_capacity && *node_id < best_id)
                {
                    Some((capacity, *node_id))
                } else {
                    Some((best_capacity, best_id))
                }
            }
        };
    }
    best.map(|(_, node_id)| node_id)
}

fn deduct(view: &mut HashMap<NodeId, NodeResources>, node_id: &NodeId, demand: &ResourceSet) {
    if let Some(node) = view.get_mut(node_id) {
        for (name, quantity) in demand {
            if let Some(available) = node.available.get_mut(name) {
                *available = (*available - quantity).max(0.0);
            }
        }
    }
}

fn sum_demands(demands: &[ResourceSet]) -> ResourceSet {
    let mut sum = ResourceSet::new();
    for demand in demands {
        for (name, quantity) in demand {
            *sum.entry(name.clone()).or_insert(0.0) += quantity;
        }
    }
    sum
}

/// Pick a node for a single demand.
pub fn schedule_one(
    view: &HashMap<NodeId, NodeResources>,
    demand: &ResourceSet,
) -> SchedulingResult {
    match best_feasible_node(view, demand, |_| false) {
        Some(node_id) => SchedulingResult::Success(vec![node_id]),
        None => SchedulingResult::Infeasible,
    }
}

/// Place every demand under the strategy's constraints, all-or-nothing.
/// Selection works against a scratch copy of the view so successive demands
/// see each other's deductions.
pub fn schedule(
    view: &HashMap<NodeId, NodeResources>,
    demands: &[ResourceSet],
    strategy: PlacementStrategy,
) -> SchedulingResult {
    if demands.is_empty() {
        return SchedulingResult::Success(vec![]);
    }
    match strategy {
        PlacementStrategy::StrictPack => schedule_strict_pack(view, demands),
        PlacementStrategy::StrictSpread => schedule_strict_spread(view, demands),
        PlacementStrategy::Pack => schedule_pack(view, demands),
        PlacementStrategy::Spread => schedule_spread(view, demands),
    }
}

/// All demands on one node, or nothing.
fn schedule_strict_pack(
    view: &HashMap<NodeId, NodeResources>,
    demands: &[ResourceSet],
) -> SchedulingResult {
    let combined = sum_demands(demands);
    match best_feasible_node(view, &combined, |_| false) {
        Some(node_id) => SchedulingResult::Success(vec![node_id; demands.len()]),
        None => SchedulingResult::Infeasible,
    }
}

/// One distinct node per demand, or nothing.
fn schedule_strict_spread(
    view: &HashMap<NodeId, NodeResources>,
    demands: &[ResourceSet],
) -> SchedulingResult {
    let mut scratch = view.clone();
    let mut used: Vec<NodeId> = vec![];
    for demand in demands {
        let Some(node_id) =
            best_feasible_node(&scratch, demand, |candidate| used.contains(candidate))
        else {
            return SchedulingResult::Infeasible;
        };
        deduct(&mut scratch, &node_id, demand);
        used.push(node_id);
    }
    SchedulingResult::Success(used)
}

/// Minimize distinct nodes: keep filling the current node while it fits,
/// move on when it does not.
fn schedule_pack(
    view: &HashMap<NodeId, NodeResources>,
    demands: &[ResourceSet],
) -> SchedulingResult {
    let mut scratch = view.clone();
    let mut placements: Vec<NodeId> = vec![];
    let mut current: Option<NodeId> = None;
    for demand in demands {
        let target = match current {
            Some(node_id) if scratch.get(&node_id).is_some_and(|n| n.can_fit(demand)) => {
                node_id
            }
            _ => match best_feasible_node(&scratch, demand, |_| false) {
                Some(node_id) => node_id,
                None => return SchedulingResult::Infeasible,
            },
        };
        deduct(&mut scratch, &target, demand);
        current = Some(target);
        placements.push(target);
    }
    SchedulingResult::Success(placements)
}

/// Maximize distinct nodes: avoid reusing a node while an unused feasible
/// one exists, fall back to reuse when the cluster is smaller than the
/// group.
fn schedule_spread(
    view: &HashMap<NodeId, NodeResources>,
    demands: &[ResourceSet],
) -> SchedulingResult {
    let mut scratch = view.clone();
    let mut placements: Vec<NodeId> = vec![];
    for demand in demands {
        let fresh =
            best_feasible_node(&scratch, demand, |candidate| placements.contains(candidate));
        let target = match fresh.or_else(|| best_feasible_node(&scratch, demand, |_| false))
        {
            Some(node_id) => node_id,
            None => return SchedulingResult::Infeasible,
        };
        deduct(&mut scratch, &target, demand);
        placements.push(target);
    }
    SchedulingResult::Success(placements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use gcs_core::ids::BaseId;

    fn resources(pairs: &[(&str, f64)]) -> ResourceSet {
        pairs
            .iter()
            .map(|(name, quantity)| (name.to_string(), *quantity))
            .collect()
    }

    fn node(available: &[(&str, f64)]) -> NodeResources {
        NodeResources {
            total: resources(available),
            available: resources(available),
        }
    }

    /// Two ids where `small < large` regardless of the random draw.
    fn ordered_ids() -> (NodeId, NodeId) {
        let a = NodeId::from_random();
        let b = NodeId::from_random();
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    #[test]
    fn lowest_id_wins_on_equal_capacity() {
        let (small, large) = ordered_ids();
        let view: HashMap<NodeId, NodeResources> = [
            (large, node(&[("CPU", 4.0)])),
            (small, node(&[("CPU", 4.0)])),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            schedule_one(&view, &resources(&[("CPU", 2.0)])),
            SchedulingResult::Success(vec![small])
        );
    }

    #[test]
    fn higher_remaining_capacity_wins() {
        let (small, large) = ordered_ids();
        let view: HashMap<NodeId, NodeResources> = [
            (small, node(&[("CPU", 2.0)])),
            (large, node(&[("CPU", 8.0)])),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            schedule_one(&view, &resources(&[("CPU", 2.0)])),
            SchedulingResult::Success(vec![large])
        );
    }

    #[test]
    fn infeasible_demand_is_reported() {
        let view: HashMap<NodeId, NodeResources> =
            [(NodeId::from_random(), node(&[("CPU", 1.0)]))]
                .into_iter()
                .collect();
        assert_eq!(
            schedule_one(&view, &resources(&[("CPU", 2.0)])),
            SchedulingResult::Infeasible
        );
        assert_eq!(
            schedule_one(&view, &resources(&[("GPU", 1.0)])),
            SchedulingResult::Infeasible
        );
    }

    #[test]
    fn strict_pack_uses_one_node_or_fails() {
        let (a, b) = ordered_ids();
        let view: HashMap<NodeId, NodeResources> =
            [(a, node(&[("CPU", 4.0)])), (b, node(&[("CPU", 4.0)]))]
                .into_iter()
                .collect();
        let demands = vec![resources(&[("CPU", 2.0)]), resources(&[("CPU", 2.0)])];
        match schedule(&view, &demands, PlacementStrategy::StrictPack) {
            SchedulingResult::Success(nodes) => {
                assert_eq!(nodes.len(), 2);
                assert_eq!(nodes[0], nodes[1]);
            }
            SchedulingResult::Infeasible => panic!("expected success"),
        }

        // 3 + 3 CPUs cannot fit on any single node.
        let demands = vec![resources(&[("CPU", 3.0)]), resources(&[("CPU", 3.0)])];
        assert_eq!(
            schedule(&view, &demands, PlacementStrategy::StrictPack),
            SchedulingResult::Infeasible
        );
    }

    #[test]
    fn strict_spread_needs_distinct_nodes() {
        let (a, b) = ordered_ids();
        let one_node: HashMap<NodeId, NodeResources> =
            [(a, node(&[("CPU", 4.0)]))].into_iter().collect();
        let demands = vec![resources(&[("CPU", 1.0)]), resources(&[("CPU", 1.0)])];
        assert_eq!(
            schedule(&one_node, &demands, PlacementStrategy::StrictSpread),
            SchedulingResult::Infeasible
        );

        let two_nodes: HashMap<NodeId, NodeResources> =
            [(a, node(&[("CPU", 4.0)])), (b, node(&[("CPU", 4.0)]))]
                .into_iter()
                .collect();
        match schedule(&two_nodes, &demands, PlacementStrategy::StrictSpread) {
            SchedulingResult::Success(nodes) => {
                let distinct: HashSet<_> = nodes.iter().collect();
                assert_eq!(distinct.len(), 2);
            }
            SchedulingResult::Infeasible => panic!("expected success"),
        }
    }

    #[test]
    fn pack_minimizes_distinct_nodes() {
        let (a, b) = ordered_ids();
        let view: HashMap<NodeId, NodeResources> =
            [(a, node(&[("CPU", 4.0)])), (b, node(&[("CPU", 4.0)]))]
                .into_iter()
                .collect();
        let demands = vec![
            resources(&[("CPU", 2.0)]),
            resources(&[("CPU", 2.0)]),
            resources(&[("CPU", 2.0)]),
        ];
        match schedule(&view, &demands, PlacementStrategy::Pack) {
            SchedulingResult::Success(nodes) => {
                let distinct: HashSet<_> = nodes.iter().collect();
                assert_eq!(distinct.len(), 2);
                // The first two bundles share a node.
                assert_eq!(nodes[0], nodes[1]);
            }
            SchedulingResult::Infeasible => panic!("expected success"),
        }
    }

    #[test]
    fn spread_maximizes_distinct_nodes_but_reuses_when_forced() {
        let (a, b) = ordered_ids();
        let view: HashMap<NodeId, NodeResources> =
            [(a, node(&[("CPU", 4.0)])), (b, node(&[("CPU", 4.0)]))]
                .into_iter()
                .collect();
        let demands = vec![
            resources(&[("CPU", 1.0)]),
            resources(&[("CPU", 1.0)]),
            resources(&[("CPU", 1.0)]),
        ];
        match schedule(&view, &demands, PlacementStrategy::Spread) {
            SchedulingResult::Success(nodes) => {
                let distinct: HashSet<_> = nodes.iter().collect();
                assert_eq!(distinct.len(), 2);
            }
            SchedulingResult::Infeasible => panic!("expected success"),
        }
    }

    #[test]
    fn selection_does_not_mutate_the_view() {
        let node_id = NodeId::from_random();
        let view: HashMap<NodeId, NodeResources> =
            [(node_id, node(&[("CPU", 4.0)]))].into_iter().collect();
        let demands = vec![resources(&[("CPU", 2.0)]), resources(&[("CPU", 2.0)])];
        let _ = schedule(&view, &demands, PlacementStrategy::Pack);
        assert_eq!(view[&node_id].available["CPU"], 4.0);
    }
}
