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

//! Authoritative node registry. A node id appears in the alive set at most
//! once, transitions to DEAD exactly once, and never comes back under the
//! same id.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use gcs_core::error::{GcsError, Result};
use gcs_core::ids::{BaseId, NodeId};
use gcs_core::serde::protobuf::{GcsNodeInfo, GcsNodeState};
use gcs_core::serde::encode_protobuf;

use crate::init_data::GcsInitData;
use crate::pubsub::{GcsPublisher, NODE_CHANNEL};
use crate::storage::GcsTableStorage;

pub struct NodeManager {
    alive_nodes: RwLock<HashMap<NodeId, Arc<GcsNodeInfo>>>,
    dead_nodes: RwLock<HashMap<NodeId, Arc<GcsNodeInfo>>>,
    storage: Arc<GcsTableStorage>,
    publisher: Arc<dyn GcsPublisher>,
}

impl NodeManager {
    pub fn new(storage: Arc<GcsTableStorage>, publisher: Arc<dyn GcsPublisher>) -> Self {
        Self {
            alive_nodes: RwLock::new(HashMap::new()),
            dead_nodes: RwLock::new(HashMap::new()),
            storage,
            publisher,
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        let mut alive = self.alive_nodes.write();
        let mut dead = self.dead_nodes.write();
        for (node_id, node) in &init_data.nodes {
            let node = Arc::new(node.clone());
            match node.state() {
                GcsNodeState::Alive => {
                    alive.insert(*node_id, node);
                }
                GcsNodeState::Dead => {
                    dead.insert(*node_id, node);
                }
            }
        }
    }

    /// Register a raylet. If another alive node claims the same address the
    /// most recent registration wins and the previous node is forced dead
    /// first; the returned vec carries such evictions so the caller can run
    /// the node-removed cascade for them.
    pub async fn register_node(
        &self,
        mut node: GcsNodeInfo,
    ) -> Result<(Arc<GcsNodeInfo>, Vec<Arc<GcsNodeInfo>>)> {
        let node_id = NodeId::from_binary(&node.node_id)?;
        if self.dead_nodes.read().contains_key(&node_id) {
            return Err(GcsError::Invalid(format!(
                "node {node_id} is already dead and cannot re-register"
            )));
        }
        if self.alive_nodes.read().contains_key(&node_id) {
            return Err(GcsError::Invalid(format!(
                "node {node_id} is already registered"
            )));
        }

        let conflicting: Vec<NodeId> = {
            let alive = self.alive_nodes.read();
            alive
                .iter()
                .filter(|(_, existing)| existing.address == node.address)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut evicted = Vec::with_capacity(conflicting.len());
        for stale_id in conflicting {
            warn!(
                "Node {} re-registered under a new id, forcing the old one dead",
                stale_id
            );
            if let Some(stale) = self.on_node_failure(stale_id).await? {
                evicted.push(stale);
            }
        }

        node.set_state(GcsNodeState::Alive);
        self.storage.node_table().put(&node_id, &node).await?;
        let node = Arc::new(node);
        self.alive_nodes.write().insert(node_id, node.clone());
        self.publisher
            .publish(NODE_CHANNEL, node_id.as_bytes(), encode_protobuf(&*node))
            .await?;
        info!("Registered node {}", node_id);
        Ok((node, evicted))
    }

    /// Transition a node to DEAD. Idempotent: a node that is not alive is
    /// left untouched and `None` is returned, so the death cascade runs at
    /// most once per node.
    pub async fn on_node_failure(
        &self,
        node_id: NodeId,
    ) -> Result<Option<Arc<GcsNodeInfo>>> {
        let Some(node) = self.alive_nodes.write().remove(&node_id) else {
            return Ok(None);
        };
        let mut dead = (*node).clone();
        dead.set_state(GcsNodeState::Dead);
        self.storage.node_table().put(&node_id, &dead).await?;
        let dead = Arc::new(dead);
        self.dead_nodes.write().insert(node_id, dead.clone());
        self.publisher
            .publish(NODE_CHANNEL, node_id.as_bytes(), encode_protobuf(&*dead))
            .await?;
        warn!("Node {} is dead", node_id);
        Ok(Some(dead))
    }

    pub fn get_node(&self, node_id: &NodeId) -> Option<Arc<GcsNodeInfo>> {
        if let Some(node) = self.alive_nodes.read().get(node_id) {
            return Some(node.clone());
        }
        self.dead_nodes.read().get(node_id).cloned()
    }

    pub fn get_alive_node(&self, node_id: &NodeId) -> Option<Arc<GcsNodeInfo>> {
        self.alive_nodes.read().get(node_id).cloned()
    }

    pub fn is_alive(&self, node_id: &NodeId) -> bool {
        self.alive_nodes.read().contains_key(node_id)
    }

    pub fn get_all_alive_nodes(&self) -> Vec<Arc<GcsNodeInfo>> {
        self.alive_nodes.read().values().cloned().collect()
    }

    pub fn get_all_alive_node_ids(&self) -> Vec<NodeId> {
        self.alive_nodes.read().keys().copied().collect()
    }

    pub fn get_all_nodes(&self) -> Vec<Arc<GcsNodeInfo>> {
        let alive = self.alive_nodes.read();
        let dead = self.dead_nodes.read();
        alive.values().chain(dead.values()).cloned().collect()
    }

    pub fn debug_string(&self) -> String {
        format!(
            "NodeManager {{ alive: {}, dead: {} }}",
            self.alive_nodes.read().len(),
            self.dead_nodes.read().len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::pubsub::DirectPublisher;
    use crate::storage::kv::MemoryKvStore;
    use crate::storage::RetryPolicy;

    fn manager() -> NodeManager {
        let storage = Arc::new(GcsTableStorage::new(
            Arc::new(MemoryKvStore::new()),
            RetryPolicy::new(1, 3),
        ));
        let publisher = Arc::new(DirectPublisher::new(Duration::from_secs(10), 100));
        NodeManager::new(storage, publisher)
    }

    fn node_info(id: NodeId, ip: &str, port: u32) -> GcsNodeInfo {
        GcsNodeInfo {
            node_id: id.binary(),
            address: Some(gcs_core::serde::protobuf::NodeAddress {
                ip: ip.to_owned(),
                port,
            }),
            resources_total: [("CPU".to_owned(), 4.0)].into_iter().collect(),
            state: GcsNodeState::Alive as i32,
        }
    }

    #[tokio::test]
    async fn register_then_fail_is_exactly_once() {
        let manager = manager();
        let node_id = NodeId::from_random();
        manager
            .register_node(node_info(node_id, "10.0.0.1", 1))
            .await
            .unwrap();
        assert!(manager.is_alive(&node_id));

        let dead = manager.on_node_failure(node_id).await.unwrap();
        assert_eq!(dead.unwrap().state(), GcsNodeState::Dead);
        assert!(!manager.is_alive(&node_id));

        // Second failure is a no-op, so the cascade cannot run twice.
        assert!(manager.on_node_failure(node_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_node_cannot_resurrect() {
        let manager = manager();
        let node_id = NodeId::from_random();
        let info = node_info(node_id, "10.0.0.1", 1);
        manager.register_node(info.clone()).await.unwrap();
        manager.on_node_failure(node_id).await.unwrap();
        assert!(manager.register_node(info).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_address_evicts_previous_node() {
        let manager = manager();
        let old_id = NodeId::from_random();
        let new_id = NodeId::from_random();
        manager
            .register_node(node_info(old_id, "10.0.0.1", 1))
            .await
            .unwrap();
        let (_, evicted) = manager
            .register_node(node_info(new_id, "10.0.0.1", 1))
            .await
            .unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(
            NodeId::from_binary(&evicted[0].node_id).unwrap(),
            old_id
        );
        assert!(!manager.is_alive(&old_id));
        assert!(manager.is_alive(&new_id));
    }

    #[tokio::test]
    async fn initialize_restores_alive_and_dead_sets() {
        let manager = manager();
        let mut init_data = GcsInitData::default();
        let alive_id = NodeId::from_random();
        let dead_id = NodeId::from_random();
        init_data
            .nodes
            .insert(alive_id, node_info(alive_id, "10.0.0.1", 1));
        let mut dead = node_info(dead_id, "10.0.0.2", 1);
        dead.set_state(GcsNodeState::Dead);
        init_data.nodes.insert(dead_id, dead);

        manager.initialize(&init_data);
        assert!(manager.is_alive(&alive_id));
        assert!(!manager.is_alive(&dead_id));
        assert!(manager.get_node(&dead_id).is_some());
    }
}
