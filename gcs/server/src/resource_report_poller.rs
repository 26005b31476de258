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

//! Pull-based resource reporting: one polling task per alive raylet. A poll
//! that overruns its deadline is cancelled and retried on the next tick, so
//! one slow raylet never blocks the cadence.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::task::JoinHandle;

use gcs_core::ids::{BaseId, NodeId};
use gcs_core::serde::protobuf::{
    GcsNodeInfo, GcsNodeState, RequestResourceReportParams, ResourcesData,
};

use crate::init_data::GcsInitData;
use crate::raylet_client::RayletClientPool;

pub type ResourceReportHandler = Arc<dyn Fn(ResourcesData) + Send + Sync>;

pub struct ResourceReportPoller {
    polls: DashMap<NodeId, JoinHandle<()>>,
    client_pool: RayletClientPool,
    period: Duration,
    poll_timeout: Duration,
    report_handler: ResourceReportHandler,
}

impl ResourceReportPoller {
    pub fn new(
        client_pool: RayletClientPool,
        period_ms: u64,
        poll_timeout_ms: u64,
        report_handler: ResourceReportHandler,
    ) -> Self {
        Self {
            polls: DashMap::new(),
            client_pool,
            period: Duration::from_millis(period_ms),
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            report_handler,
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        for node in init_data.nodes.values() {
            if node.state() == GcsNodeState::Alive {
                self.handle_node_added(node);
            }
        }
    }

    pub fn handle_node_added(&self, node: &GcsNodeInfo) {
        let Ok(node_id) = NodeId::from_binary(&node.node_id) else {
            return;
        };
        let Some(address) = node.address.clone() else {
            warn!("Node {} has no address, not polling it", node_id);
            return;
        };
        let client = self.client_pool.get_or_connect(&node_id, &address);
        let handler = self.report_handler.clone();
        let period = self.period;
        let poll_timeout = self.poll_timeout;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let poll = client.request_resource_report(RequestResourceReportParams {});
                match tokio::time::timeout(poll_timeout, poll).await {
                    Ok(Ok(result)) => {
                        if let Some(resources) = result.resources {
                            handler(resources);
                        }
                    }
                    Ok(Err(e)) => {
                        debug!("Resource poll of node {} failed: {}", node_id, e);
                    }
                    Err(_) => {
                        warn!(
                            "Resource poll of node {} exceeded {:?}, retrying next tick",
                            node_id, poll_timeout
                        );
                    }
                }
            }
        });
        if let Some(previous) = self.polls.insert(node_id, handle) {
            previous.abort();
        }
    }

    pub fn handle_node_removed(&self, node_id: &NodeId) {
        if let Some((_, handle)) = self.polls.remove(node_id) {
            handle.abort();
            debug!("Stopped resource polling for node {}", node_id);
        }
    }

    pub fn stop(&self) {
        self.polls.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    pub fn polled_nodes(&self) -> usize {
        self.polls.len()
    }
}

impl Drop for ResourceReportPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
