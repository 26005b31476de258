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

//! Node failure detection. Runs on its own loop; its only cross-loop effect
//! is handing expired node ids to the death callback, which posts onto the
//! main loop. Must not run before the RPC surface serves (nodes cannot
//! refresh their deadline until then) and must stop before it goes away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use gcs_core::ids::NodeId;
use gcs_core::serde::protobuf::GcsNodeState;

use crate::init_data::GcsInitData;

pub type NodeDeathCallback = Arc<dyn Fn(NodeId) + Send + Sync>;

pub struct HeartbeatManager {
    /// Per-node expiry deadline, refreshed on every heartbeat.
    deadlines: Arc<DashMap<NodeId, Instant>>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    on_node_death: NodeDeathCallback,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatManager {
    pub fn new(
        heartbeat_interval_ms: u64,
        heartbeat_timeout_ms: u64,
        on_node_death: NodeDeathCallback,
    ) -> Self {
        Self {
            deadlines: Arc::new(DashMap::new()),
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(heartbeat_timeout_ms),
            on_node_death,
            sweeper: Mutex::new(None),
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        for (node_id, node) in &init_data.nodes {
            if node.state() == GcsNodeState::Alive {
                self.add_node(*node_id);
            }
        }
    }

    /// Start the sweep timer. Only called once the RPC server is serving;
    /// otherwise nodes would be declared dead during warmup.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let deadlines = self.deadlines.clone();
        let on_node_death = self.on_node_death.clone();
        let tick = self.heartbeat_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let now = Instant::now();
                // A deadline exactly at the boundary is not expired.
                let expired: Vec<NodeId> = deadlines
                    .iter()
                    .filter(|entry| now > *entry.value())
                    .map(|entry| *entry.key())
                    .collect();
                for node_id in expired {
                    if deadlines.remove(&node_id).is_some() {
                        warn!(
                            "Node {} missed its heartbeat deadline, reporting failure",
                            node_id
                        );
                        on_node_death(node_id);
                    }
                }
            }
        }));
    }

    /// Stop sweeping. Called before the RPC server shuts down so a slow
    /// shutdown does not declare live nodes dead.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    pub fn add_node(&self, node_id: NodeId) {
        self.deadlines
            .insert(node_id, Instant::now() + self.heartbeat_timeout);
    }

    pub fn remove_node(&self, node_id: &NodeId) {
        self.deadlines.remove(node_id);
    }

    /// Refresh the node's deadline. Returns false for nodes the detector
    /// does not track, in which case the raylet must re-register.
    pub fn refresh(&self, node_id: &NodeId) -> bool {
        match self.deadlines.get_mut(node_id) {
            Some(mut deadline) => {
                *deadline = Instant::now() + self.heartbeat_timeout;
                debug!("Refreshed heartbeat deadline for node {}", node_id);
                true
            }
            None => false,
        }
    }

    pub fn tracked_nodes(&self) -> usize {
        self.deadlines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use gcs_core::ids::BaseId;

    fn collector() -> (NodeDeathCallback, Arc<StdMutex<Vec<NodeId>>>) {
        let dead = Arc::new(StdMutex::new(vec![]));
        let sink = dead.clone();
        let callback: NodeDeathCallback =
            Arc::new(move |node_id| sink.lock().unwrap().push(node_id));
        (callback, dead)
    }

    #[tokio::test]
    async fn expired_node_is_reported_once() {
        let (callback, dead) = collector();
        let manager = HeartbeatManager::new(5, 20, callback);
        let node_id = NodeId::from_random();
        manager.add_node(node_id);
        manager.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dead.lock().unwrap().as_slice(), &[node_id]);
        assert_eq!(manager.tracked_nodes(), 0);
        manager.stop();
    }

    #[tokio::test]
    async fn refreshed_node_stays_alive() {
        let (callback, dead) = collector();
        let manager = HeartbeatManager::new(5, 60, callback);
        let node_id = NodeId::from_random();
        manager.add_node(node_id);
        manager.start();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(manager.refresh(&node_id));
        }
        assert!(dead.lock().unwrap().is_empty());
        manager.stop();
    }

    #[tokio::test]
    async fn unknown_node_requires_reregistration() {
        let (callback, _dead) = collector();
        let manager = HeartbeatManager::new(5, 60, callback);
        assert!(!manager.refresh(&NodeId::from_random()));
    }

    #[tokio::test]
    async fn no_expiry_after_stop() {
        let (callback, dead) = collector();
        let manager = HeartbeatManager::new(5, 20, callback);
        manager.add_node(NodeId::from_random());
        manager.start();
        manager.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dead.lock().unwrap().is_empty());
        assert_eq!(manager.tracked_nodes(), 1);
    }
}
