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

//! Outbound RPC surface toward raylets. The pool de-duplicates clients by
//! node id and is shared by every manager; the transport behind the factory
//! is out of scope here, tests plug in mocks.

use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use gcs_core::error::{GcsError, Result};
use gcs_core::ids::NodeId;
use gcs_core::serde::protobuf::{
    CancelResourceReserveParams, CancelResourceReserveResult,
    CommitBundleResourcesParams, CommitBundleResourcesResult,
    CreateActorOnRayletParams, CreateActorOnRayletResult, KillActorParams,
    KillActorResult, NodeAddress, PrepareBundleResourcesParams,
    PrepareBundleResourcesResult, RequestResourceReportParams,
    RequestResourceReportResult, UpdateResourceUsageParams,
    UpdateResourceUsageResult,
};

#[tonic::async_trait]
pub trait RayletClient: Send + Sync + 'static {
    async fn request_resource_report(
        &self,
        request: RequestResourceReportParams,
    ) -> Result<RequestResourceReportResult>;

    async fn update_resource_usage(
        &self,
        request: UpdateResourceUsageParams,
    ) -> Result<UpdateResourceUsageResult>;

    async fn create_actor(
        &self,
        request: CreateActorOnRayletParams,
    ) -> Result<CreateActorOnRayletResult>;

    async fn kill_actor(&self, request: KillActorParams) -> Result<KillActorResult>;

    async fn prepare_bundle_resources(
        &self,
        request: PrepareBundleResourcesParams,
    ) -> Result<PrepareBundleResourcesResult>;

    async fn commit_bundle_resources(
        &self,
        request: CommitBundleResourcesParams,
    ) -> Result<CommitBundleResourcesResult>;

    async fn cancel_resource_reserve(
        &self,
        request: CancelResourceReserveParams,
    ) -> Result<CancelResourceReserveResult>;
}

/// Creates clients from node addresses. The production factory dials the
/// raylet's gRPC endpoint; tests return mocks.
pub trait RayletClientFactory: Send + Sync + 'static {
    fn create_client(&self, address: &NodeAddress) -> Arc<dyn RayletClient>;
}

#[derive(Clone)]
pub struct RayletClientPool {
    factory: Arc<dyn RayletClientFactory>,
    clients: Arc<DashMap<NodeId, Arc<dyn RayletClient>>>,
}

impl RayletClientPool {
    pub fn new(factory: Arc<dyn RayletClientFactory>) -> Self {
        Self {
            factory,
            clients: Arc::new(DashMap::new()),
        }
    }

    /// Get or create the client for `node_id`. Connecting is serialized per
    /// node by the map entry, so concurrent callers share one client.
    pub fn get_or_connect(
        &self,
        node_id: &NodeId,
        address: &NodeAddress,
    ) -> Arc<dyn RayletClient> {
        self.clients
            .entry(*node_id)
            .or_insert_with(|| {
                debug!("Connecting to raylet {} at {}:{}", node_id, address.ip, address.port);
                self.factory.create_client(address)
            })
            .clone()
    }

    pub fn get(&self, node_id: &NodeId) -> Result<Arc<dyn RayletClient>> {
        self.clients
            .get(node_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                GcsError::NotFound(format!("no raylet client for node {node_id}"))
            })
    }

    pub fn disconnect(&self, node_id: &NodeId) {
        if self.clients.remove(node_id).is_some() {
            debug!("Disconnected raylet client for node {}", node_id);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
