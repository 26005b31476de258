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

//! The aggregated cluster resource view. Eventually consistent with the
//! latest report received per node; schedulers deduct from it optimistically
//! and the next report trues it up.

use std::collections::HashMap;

use log::debug;
use parking_lot::RwLock;

use gcs_core::ids::{BaseId, NodeId};
use gcs_core::serde::protobuf::{
    GcsNodeInfo, ResourceUsageBatchData, ResourcesData,
};

use crate::init_data::GcsInitData;

/// A resource demand or availability map. Quantities are non-negative.
pub type ResourceSet = HashMap<String, f64>;

/// Floating-point slack when comparing resource quantities.
pub const RESOURCE_EPSILON: f64 = 1e-9;

#[derive(Clone, Debug, Default)]
pub struct NodeResources {
    pub total: ResourceSet,
    pub available: ResourceSet,
}

impl NodeResources {
    pub fn can_fit(&self, demand: &ResourceSet) -> bool {
        demand.iter().all(|(name, quantity)| {
            self.available
                .get(name)
                .map(|available| *available + RESOURCE_EPSILON >= *quantity)
                .unwrap_or(*quantity <= RESOURCE_EPSILON)
        })
    }

    fn deduct(&mut self, demand: &ResourceSet) {
        for (name, quantity) in demand {
            if let Some(available) = self.available.get_mut(name) {
                *available = (*available - quantity).max(0.0);
            }
        }
    }

    fn restore(&mut self, demand: &ResourceSet) {
        for (name, quantity) in demand {
            let total = self.total.get(name).copied().unwrap_or(0.0);
            let available = self.available.entry(name.clone()).or_insert(0.0);
            *available = (*available + quantity).min(total);
        }
    }
}

#[derive(Default)]
struct NodeUsage {
    latest: ResourcesData,
    applied_sequence: Option<u64>,
}

pub struct ResourceManager {
    /// Scheduling view, adjusted by acquire/release between reports.
    cluster_resources: RwLock<HashMap<NodeId, NodeResources>>,
    /// Raw latest report per node, for broadcast.
    usage: RwLock<HashMap<NodeId, NodeUsage>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            cluster_resources: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        for (node_id, node) in &init_data.nodes {
            if node.state() == gcs_core::serde::protobuf::GcsNodeState::Alive {
                self.on_node_add(*node_id, node);
            }
        }
    }

    pub fn on_node_add(&self, node_id: NodeId, node: &GcsNodeInfo) {
        self.cluster_resources.write().insert(
            node_id,
            NodeResources {
                total: node.resources_total.clone(),
                available: node.resources_total.clone(),
            },
        );
    }

    pub fn on_node_dead(&self, node_id: &NodeId) {
        self.cluster_resources.write().remove(node_id);
        self.usage.write().remove(node_id);
    }

    /// Apply a node's resource report. Reports whose sequence is lower than
    /// the last applied one are stale and dropped; the per-node applied
    /// sequence never decreases.
    pub fn update_from_resource_report(&self, report: ResourcesData) -> bool {
        let Ok(node_id) = NodeId::from_binary(&report.node_id) else {
            debug!("Dropping resource report with malformed node id");
            return false;
        };
        {
            let mut usage = self.usage.write();
            let entry = usage.entry(node_id).or_default();
            if let Some(applied) = entry.applied_sequence {
                if report.sequence < applied {
                    debug!(
                        "Dropping stale resource report from node {} (seq {} < {})",
                        node_id, report.sequence, applied
                    );
                    return false;
                }
            }
            entry.applied_sequence = Some(report.sequence);
            entry.latest = report.clone();
        }

        let mut cluster = self.cluster_resources.write();
        let node = cluster.entry(node_id).or_default();
        if !report.resources_total.is_empty() {
            node.total = report.resources_total;
        }
        node.available = report.resources_available;
        true
    }

    pub fn applied_sequence(&self, node_id: &NodeId) -> Option<u64> {
        self.usage
            .read()
            .get(node_id)
            .and_then(|usage| usage.applied_sequence)
    }

    /// Snapshot the usage map into a broadcast buffer.
    pub fn get_resource_usage_batch_for_broadcast(
        &self,
        buffer: &mut ResourceUsageBatchData,
    ) {
        buffer.batch.clear();
        let usage = self.usage.read();
        let mut batch: Vec<ResourcesData> =
            usage.values().map(|u| u.latest.clone()).collect();
        batch.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        buffer.batch = batch;
    }

    /// Deduct `demand` from the node's availability. Fails without mutation
    /// when the node is unknown or lacks capacity.
    pub fn acquire_resources(&self, node_id: &NodeId, demand: &ResourceSet) -> bool {
        let mut cluster = self.cluster_resources.write();
        match cluster.get_mut(node_id) {
            Some(node) if node.can_fit(demand) => {
                node.deduct(demand);
                true
            }
            _ => false,
        }
    }

    /// Return previously acquired resources. A node that died in the
    /// meantime is simply gone, and that is fine: its resources left the
    /// view with it.
    pub fn release_resources(&self, node_id: &NodeId, demand: &ResourceSet) {
        if let Some(node) = self.cluster_resources.write().get_mut(node_id) {
            node.restore(demand);
        }
    }

    pub fn get_node_resources(&self, node_id: &NodeId) -> Option<NodeResources> {
        self.cluster_resources.read().get(node_id).cloned()
    }

    /// Clone of the scheduling view, for the pure scheduler.
    pub fn cluster_view(&self) -> HashMap<NodeId, NodeResources> {
        self.cluster_resources.read().clone()
    }

    pub fn debug_string(&self) -> String {
        format!(
            "ResourceManager {{ nodes: {}, reports: {} }}",
            self.cluster_resources.read().len(),
            self.usage.read().len()
        )
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
