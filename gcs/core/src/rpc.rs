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

//! Grouped RPC services, one per manager. These traits are the seam where a
//! generated gRPC transport attaches; handlers never see the wire codec.

use tonic::{Request, Response, Status};

use crate::serde::protobuf::*;

#[tonic::async_trait]
pub trait NodeInfoGcs: Send + Sync + 'static {
    async fn register_node(
        &self,
        request: Request<RegisterNodeParams>,
    ) -> Result<Response<RegisterNodeResult>, Status>;

    async fn unregister_node(
        &self,
        request: Request<UnregisterNodeParams>,
    ) -> Result<Response<UnregisterNodeResult>, Status>;

    async fn get_all_node_info(
        &self,
        request: Request<GetAllNodeInfoParams>,
    ) -> Result<Response<GetAllNodeInfoResult>, Status>;
}

#[tonic::async_trait]
pub trait HeartbeatInfoGcs: Send + Sync + 'static {
    async fn report_heartbeat(
        &self,
        request: Request<ReportHeartbeatParams>,
    ) -> Result<Response<ReportHeartbeatResult>, Status>;
}

#[tonic::async_trait]
pub trait NodeResourceInfoGcs: Send + Sync + 'static {
    async fn report_resource_usage(
        &self,
        request: Request<ReportResourceUsageParams>,
    ) -> Result<Response<ReportResourceUsageResult>, Status>;

    async fn get_all_resource_usage(
        &self,
        request: Request<GetAllResourceUsageParams>,
    ) -> Result<Response<GetAllResourceUsageResult>, Status>;
}

#[tonic::async_trait]
pub trait JobInfoGcs: Send + Sync + 'static {
    async fn add_job(
        &self,
        request: Request<AddJobParams>,
    ) -> Result<Response<AddJobResult>, Status>;

    async fn mark_job_finished(
        &self,
        request: Request<MarkJobFinishedParams>,
    ) -> Result<Response<MarkJobFinishedResult>, Status>;

    async fn get_all_job_info(
        &self,
        request: Request<GetAllJobInfoParams>,
    ) -> Result<Response<GetAllJobInfoResult>, Status>;
}

#[tonic::async_trait]
pub trait ActorInfoGcs: Send + Sync + 'static {
    async fn register_actor(
        &self,
        request: Request<RegisterActorParams>,
    ) -> Result<Response<RegisterActorResult>, Status>;

    async fn create_actor(
        &self,
        request: Request<CreateActorParams>,
    ) -> Result<Response<CreateActorResult>, Status>;

    async fn get_actor_info(
        &self,
        request: Request<GetActorInfoParams>,
    ) -> Result<Response<GetActorInfoResult>, Status>;

    async fn get_named_actor_info(
        &self,
        request: Request<GetNamedActorInfoParams>,
    ) -> Result<Response<GetNamedActorInfoResult>, Status>;

    async fn get_all_actor_info(
        &self,
        request: Request<GetAllActorInfoParams>,
    ) -> Result<Response<GetAllActorInfoResult>, Status>;

    async fn kill_actor_via_gcs(
        &self,
        request: Request<KillActorViaGcsParams>,
    ) -> Result<Response<KillActorViaGcsResult>, Status>;
}

#[tonic::async_trait]
pub trait PlacementGroupInfoGcs: Send + Sync + 'static {
    async fn create_placement_group(
        &self,
        request: Request<CreatePlacementGroupParams>,
    ) -> Result<Response<CreatePlacementGroupResult>, Status>;

    async fn remove_placement_group(
        &self,
        request: Request<RemovePlacementGroupParams>,
    ) -> Result<Response<RemovePlacementGroupResult>, Status>;

    async fn get_placement_group(
        &self,
        request: Request<GetPlacementGroupParams>,
    ) -> Result<Response<GetPlacementGroupResult>, Status>;

    async fn get_all_placement_group(
        &self,
        request: Request<GetAllPlacementGroupParams>,
    ) -> Result<Response<GetAllPlacementGroupResult>, Status>;
}

#[tonic::async_trait]
pub trait WorkerInfoGcs: Send + Sync + 'static {
    async fn add_worker_info(
        &self,
        request: Request<AddWorkerInfoParams>,
    ) -> Result<Response<AddWorkerInfoResult>, Status>;

    async fn report_worker_failure(
        &self,
        request: Request<ReportWorkerFailureParams>,
    ) -> Result<Response<ReportWorkerFailureResult>, Status>;

    async fn get_worker_info(
        &self,
        request: Request<GetWorkerInfoParams>,
    ) -> Result<Response<GetWorkerInfoResult>, Status>;
}

#[tonic::async_trait]
pub trait ObjectInfoGcs: Send + Sync + 'static {
    async fn add_object_location(
        &self,
        request: Request<AddObjectLocationParams>,
    ) -> Result<Response<AddObjectLocationResult>, Status>;

    async fn remove_object_location(
        &self,
        request: Request<RemoveObjectLocationParams>,
    ) -> Result<Response<RemoveObjectLocationResult>, Status>;

    async fn get_object_locations(
        &self,
        request: Request<GetObjectLocationsParams>,
    ) -> Result<Response<GetObjectLocationsResult>, Status>;
}

#[tonic::async_trait]
pub trait InternalKvGcs: Send + Sync + 'static {
    async fn internal_kv_get(
        &self,
        request: Request<InternalKvGetParams>,
    ) -> Result<Response<InternalKvGetResult>, Status>;

    async fn internal_kv_put(
        &self,
        request: Request<InternalKvPutParams>,
    ) -> Result<Response<InternalKvPutResult>, Status>;

    async fn internal_kv_del(
        &self,
        request: Request<InternalKvDelParams>,
    ) -> Result<Response<InternalKvDelResult>, Status>;

    async fn internal_kv_exists(
        &self,
        request: Request<InternalKvExistsParams>,
    ) -> Result<Response<InternalKvExistsResult>, Status>;

    async fn internal_kv_keys(
        &self,
        request: Request<InternalKvKeysParams>,
    ) -> Result<Response<InternalKvKeysResult>, Status>;
}
