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

//! Push-based resource fan-out. When `grpc_based_resource_broadcast` is on,
//! the aggregated usage batch is sent to every alive raylet on a fixed
//! cadence; otherwise the poller alone is authoritative and this never
//! starts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use gcs_core::ids::{BaseId, NodeId};
use gcs_core::serde::protobuf::{
    GcsNodeInfo, GcsNodeState, NodeAddress, ResourceUsageBatchData,
    UpdateResourceUsageParams,
};

use crate::init_data::GcsInitData;
use crate::raylet_client::RayletClientPool;

pub type BroadcastBufferFiller =
    Arc<dyn Fn(&mut ResourceUsageBatchData) + Send + Sync>;

pub struct ResourceBroadcaster {
    nodes: Arc<RwLock<HashMap<NodeId, NodeAddress>>>,
    client_pool: RayletClientPool,
    period: Duration,
    fill_buffer: BroadcastBufferFiller,
    broadcasts_sent: Arc<AtomicU64>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceBroadcaster {
    pub fn new(
        client_pool: RayletClientPool,
        period_ms: u64,
        fill_buffer: BroadcastBufferFiller,
    ) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            client_pool,
            period: Duration::from_millis(period_ms),
            fill_buffer,
            broadcasts_sent: Arc::new(AtomicU64::new(0)),
            ticker: Mutex::new(None),
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        for node in init_data.nodes.values() {
            if node.state() == GcsNodeState::Alive {
                self.handle_node_added(node);
            }
        }
    }

    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let nodes = self.nodes.clone();
        let client_pool = self.client_pool.clone();
        let fill_buffer = self.fill_buffer.clone();
        let period = self.period;
        let broadcasts_sent = self.broadcasts_sent.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let mut buffer = ResourceUsageBatchData::default();
                fill_buffer(&mut buffer);
                let targets: Vec<(NodeId, NodeAddress)> = nodes
                    .read()
                    .iter()
                    .map(|(id, address)| (*id, address.clone()))
                    .collect();
                for (node_id, address) in targets {
                    let client = client_pool.get_or_connect(&node_id, &address);
                    let request = UpdateResourceUsageParams {
                        batch: Some(buffer.clone()),
                    };
                    let sent = broadcasts_sent.clone();
                    tokio::spawn(async move {
                        match client.update_resource_usage(request).await {
                            Ok(_) => {
                                sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                warn!(
                                    "Failed to broadcast resource usage to node {}: {}",
                                    node_id, e
                                );
                            }
                        }
                    });
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }

    pub fn handle_node_added(&self, node: &GcsNodeInfo) {
        let Ok(node_id) = NodeId::from_binary(&node.node_id) else {
            return;
        };
        let Some(address) = node.address.clone() else {
            warn!("Node {} has no address, not broadcasting to it", node_id);
            return;
        };
        self.nodes.write().insert(node_id, address);
    }

    pub fn handle_node_removed(&self, node_id: &NodeId) {
        if self.nodes.write().remove(node_id).is_some() {
            debug!("Stopped broadcasting to node {}", node_id);
        }
    }

    pub fn debug_string(&self) -> String {
        format!(
            "ResourceBroadcaster {{ targets: {}, broadcasts_sent: {} }}",
            self.nodes.read().len(),
            self.broadcasts_sent.load(Ordering::Relaxed)
        )
    }
}

impl Drop for ResourceBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}
