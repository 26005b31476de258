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

//! Group placement. An attempt is all-or-nothing: select a node for every
//! unplaced bundle under the strategy, deduct the capacity, then run
//! prepare/commit against the chosen raylets. Any slip fails the whole
//! attempt; prepared reservations are cancelled and capacity returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};

use gcs_core::error::Result;
use gcs_core::event_loop::EventSender;
use gcs_core::ids::{BaseId, NodeId, PlacementGroupId};
use gcs_core::serde::protobuf::{
    Bundle, BundleState, CancelResourceReserveParams, CommitBundleResourcesParams,
    PlacementGroupTableData, PlacementStrategy, PrepareBundleResourcesParams,
};

use crate::actor_scheduler::NodeAddressResolver;
use crate::event::GcsEvent;
use crate::raylet_client::RayletClientPool;
use crate::resource_manager::{ResourceManager, ResourceSet};
use crate::resource_scheduler::{self, SchedulingResult};

pub struct PlacementGroupScheduler {
    resource_manager: Arc<ResourceManager>,
    client_pool: RayletClientPool,
    resolve_address: NodeAddressResolver,
    event_sender: EventSender<GcsEvent>,
    rpc_timeout: Duration,
    inflight: Arc<DashMap<PlacementGroupId, ()>>,
}

impl PlacementGroupScheduler {
    pub fn new(
        resource_manager: Arc<ResourceManager>,
        client_pool: RayletClientPool,
        resolve_address: NodeAddressResolver,
        event_sender: EventSender<GcsEvent>,
        rpc_timeout_ms: u64,
    ) -> Self {
        Self {
            resource_manager,
            client_pool,
            resolve_address,
            event_sender,
            rpc_timeout: Duration::from_millis(rpc_timeout_ms),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Select nodes for the group's unplaced bundles. Bundles already
    /// PLACED (rescheduling keeps survivors) constrain the strict
    /// strategies: STRICT_PACK must stay on the survivors' node,
    /// STRICT_SPREAD must avoid them.
    fn select_nodes(
        &self,
        placement_group: &PlacementGroupTableData,
        unplaced: &[&Bundle],
    ) -> SchedulingResult {
        let mut view = self.resource_manager.cluster_view();
        let demands: Vec<ResourceSet> = unplaced
            .iter()
            .map(|bundle| bundle.unit_resources.clone())
            .collect();
        let placed_nodes: Vec<NodeId> = placement_group
            .bundles
            .iter()
            .filter(|bundle| bundle.state() == BundleState::Placed)
            .filter_map(|bundle| NodeId::from_binary(&bundle.node_id).ok())
            .collect();

        match placement_group.strategy() {
            PlacementStrategy::StrictPack if !placed_nodes.is_empty() => {
                // Survivors pin the node; everything missing must fit there.
                let target = placed_nodes[0];
                let combined: ResourceSet =
                    demands.iter().fold(ResourceSet::new(), |mut sum, demand| {
                        for (name, quantity) in demand {
                            *sum.entry(name.clone()).or_insert(0.0) += quantity;
                        }
                        sum
                    });
                match view.get(&target) {
                    Some(node) if node.can_fit(&combined) => {
                        SchedulingResult::Success(vec![target; demands.len()])
                    }
                    _ => SchedulingResult::Infeasible,
                }
            }
            PlacementStrategy::StrictSpread => {
                // Nodes already holding a bundle are off limits.
                view.retain(|node_id, _| !placed_nodes.contains(node_id));
                resource_scheduler::schedule(
                    &view,
                    &demands,
                    PlacementStrategy::StrictSpread,
                )
            }
            strategy => resource_scheduler::schedule(&view, &demands, strategy),
        }
    }

    /// Attempt to place the group. Non-blocking; the outcome is posted back
    /// onto the main loop.
    pub async fn schedule(&self, placement_group: &PlacementGroupTableData) -> Result<()> {
        let placement_group_id =
            PlacementGroupId::from_binary(&placement_group.placement_group_id)?;
        if self.inflight.contains_key(&placement_group_id) {
            debug!(
                "Placement group {} already has an attempt in flight, skipping",
                placement_group_id
            );
            return Ok(());
        }
        let unplaced: Vec<&Bundle> = placement_group
            .bundles
            .iter()
            .filter(|bundle| bundle.state() != BundleState::Placed)
            .collect();
        if unplaced.is_empty() {
            return self
                .event_sender
                .post_event(GcsEvent::PlacementGroupSchedulingSucceeded {
                    placement_group_id,
                    placements: vec![],
                })
                .await;
        }

        let nodes = match self.select_nodes(placement_group, &unplaced) {
            SchedulingResult::Success(nodes) => nodes,
            SchedulingResult::Infeasible => {
                debug!(
                    "Placement group {} is infeasible right now, leaving it pending",
                    placement_group_id
                );
                return self.post_failure(placement_group_id, vec![]).await;
            }
        };

        // Deduct capacity for every bundle before any RPC goes out; roll
        // back completely if one deduction fails.
        let placements: Vec<(u32, NodeId)> = unplaced
            .iter()
            .zip(nodes.iter())
            .map(|(bundle, node_id)| (bundle.bundle_index, *node_id))
            .collect();
        let mut acquired: Vec<(NodeId, ResourceSet)> = vec![];
        for (bundle, node_id) in unplaced.iter().zip(nodes.iter()) {
            if self
                .resource_manager
                .acquire_resources(node_id, &bundle.unit_resources)
            {
                acquired.push((*node_id, bundle.unit_resources.clone()));
            } else {
                for (node_id, demand) in &acquired {
                    self.resource_manager.release_resources(node_id, demand);
                }
                return self.post_failure(placement_group_id, placements).await;
            }
        }

        self.inflight.insert(placement_group_id, ());
        let resource_manager = self.resource_manager.clone();
        let client_pool = self.client_pool.clone();
        let resolve_address = self.resolve_address.clone();
        let event_sender = self.event_sender.clone();
        let inflight = self.inflight.clone();
        let rpc_timeout = self.rpc_timeout;
        let mut bundles_by_node: HashMap<NodeId, Vec<Bundle>> = HashMap::new();
        for (bundle, node_id) in unplaced.iter().zip(nodes.iter()) {
            let mut placed = (*bundle).clone();
            placed.node_id = node_id.binary();
            placed.set_state(BundleState::Pending);
            bundles_by_node.entry(*node_id).or_default().push(placed);
        }
        let pg_id_bytes = placement_group.placement_group_id.clone();

        tokio::spawn(async move {
            let mut prepared: Vec<NodeId> = vec![];
            let mut failed = false;
            for (node_id, bundles) in &bundles_by_node {
                let Some(address) = resolve_address(node_id) else {
                    failed = true;
                    break;
                };
                let client = client_pool.get_or_connect(node_id, &address);
                let request = PrepareBundleResourcesParams {
                    placement_group_id: pg_id_bytes.clone(),
                    bundles: bundles.clone(),
                };
                match tokio::time::timeout(
                    rpc_timeout,
                    client.prepare_bundle_resources(request),
                )
                .await
                {
                    Ok(Ok(result)) if result.success => prepared.push(*node_id),
                    Ok(Ok(_)) => {
                        warn!(
                            "Raylet {} declined bundle reservation for group {}",
                            node_id, placement_group_id
                        );
                        failed = true;
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(
                            "Bundle prepare on node {} failed for group {}: {}",
                            node_id, placement_group_id, e
                        );
                        failed = true;
                        break;
                    }
                    Err(_) => {
                        warn!(
                            "Bundle prepare on node {} timed out for group {}",
                            node_id, placement_group_id
                        );
                        failed = true;
                        break;
                    }
                }
            }

            if !failed {
                for (node_id, bundles) in &bundles_by_node {
                    let Some(address) = resolve_address(node_id) else {
                        failed = true;
                        break;
                    };
                    let client = client_pool.get_or_connect(node_id, &address);
                    let request = CommitBundleResourcesParams {
                        placement_group_id: pg_id_bytes.clone(),
                        bundles: bundles.clone(),
                    };
                    match tokio::time::timeout(
                        rpc_timeout,
                        client.commit_bundle_resources(request),
                    )
                    .await
                    {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            warn!(
                                "Bundle commit on node {} failed for group {}: {}",
                                node_id, placement_group_id, e
                            );
                            failed = true;
                            break;
                        }
                        Err(_) => {
                            warn!(
                                "Bundle commit on node {} timed out for group {}",
                                node_id, placement_group_id
                            );
                            failed = true;
                            break;
                        }
                    }
                }
            }

            inflight.remove(&placement_group_id);
            let event = if failed {
                // Undo everything: cancel prepared reservations and return
                // the deducted capacity.
                for node_id in &prepared {
                    if let Some(address) = resolve_address(node_id) {
                        let client = client_pool.get_or_connect(node_id, &address);
                        let indexes = bundles_by_node
                            .get(node_id)
                            .map(|bundles| {
                                bundles.iter().map(|b| b.bundle_index).collect()
                            })
                            .unwrap_or_default();
                        let request = CancelResourceReserveParams {
                            placement_group_id: pg_id_bytes.clone(),
                            bundle_indexes: indexes,
                        };
                        if let Err(e) = client.cancel_resource_reserve(request).await {
                            warn!(
                                "Failed to cancel reservation on node {}: {}",
                                node_id, e
                            );
                        }
                    }
                }
                for (node_id, bundles) in &bundles_by_node {
                    for bundle in bundles {
                        resource_manager
                            .release_resources(node_id, &bundle.unit_resources);
                    }
                }
                GcsEvent::PlacementGroupSchedulingFailed {
                    placement_group_id,
                    placements,
                }
            } else {
                GcsEvent::PlacementGroupSchedulingSucceeded {
                    placement_group_id,
                    placements,
                }
            };
            if let Err(e) = event_sender.post_event(event).await {
                warn!("Failed to post placement group outcome: {}", e);
            }
        });
        Ok(())
    }

    /// Best-effort cancellation of raylet-side reservations for an attempt
    /// that landed after its group was removed.
    pub fn cancel_placements(
        &self,
        placement_group_id: PlacementGroupId,
        placements: &[(u32, NodeId)],
    ) {
        let mut indexes_by_node: HashMap<NodeId, Vec<u32>> = HashMap::new();
        for (bundle_index, node_id) in placements {
            indexes_by_node
                .entry(*node_id)
                .or_default()
                .push(*bundle_index);
        }
        for (node_id, bundle_indexes) in indexes_by_node {
            let Some(address) = (self.resolve_address)(&node_id) else {
                continue;
            };
            let client = self.client_pool.get_or_connect(&node_id, &address);
            let request = CancelResourceReserveParams {
                placement_group_id: placement_group_id.binary(),
                bundle_indexes,
            };
            tokio::spawn(async move {
                if let Err(e) = client.cancel_resource_reserve(request).await {
                    warn!("Failed to cancel reservation on node {}: {}", node_id, e);
                }
            });
        }
    }

    /// Best-effort release of committed reservations on the raylets, used
    /// when a group is removed.
    pub fn cancel_committed_bundles(&self, placement_group: &PlacementGroupTableData) {
        let mut indexes_by_node: HashMap<NodeId, Vec<u32>> = HashMap::new();
        for bundle in &placement_group.bundles {
            if bundle.state() != BundleState::Placed {
                continue;
            }
            if let Ok(node_id) = NodeId::from_binary(&bundle.node_id) {
                indexes_by_node
                    .entry(node_id)
                    .or_default()
                    .push(bundle.bundle_index);
            }
        }
        for (node_id, bundle_indexes) in indexes_by_node {
            let Some(address) = (self.resolve_address)(&node_id) else {
                continue;
            };
            let client = self.client_pool.get_or_connect(&node_id, &address);
            let request = CancelResourceReserveParams {
                placement_group_id: placement_group.placement_group_id.clone(),
                bundle_indexes,
            };
            tokio::spawn(async move {
                if let Err(e) = client.cancel_resource_reserve(request).await {
                    warn!("Failed to cancel reservation on node {}: {}", node_id, e);
                }
            });
        }
    }

    async fn post_failure(
        &self,
        placement_group_id: PlacementGroupId,
        placements: Vec<(u32, NodeId)>,
    ) -> Result<()> {
        self.event_sender
            .post_event(GcsEvent::PlacementGroupSchedulingFailed {
                placement_group_id,
                placements,
            })
            .await
    }
}
