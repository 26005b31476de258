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

//! The grouped RPC services, implemented on the server shell. Handlers
//! validate, call into one manager, and post follow-up events; every
//! cross-manager effect rides the main loop.

use log::{debug, error, info};
use tonic::{Request, Response, Status};

use gcs_core::ids::{
    ActorId, BaseId, JobId, NodeId, ObjectId, PlacementGroupId, WorkerId,
};
use gcs_core::rpc::{
    ActorInfoGcs, HeartbeatInfoGcs, InternalKvGcs, JobInfoGcs, NodeInfoGcs,
    NodeResourceInfoGcs, ObjectInfoGcs, PlacementGroupInfoGcs, WorkerInfoGcs,
};
use gcs_core::serde::protobuf::*;

use crate::event::GcsEvent;
use crate::server::GcsServer;

fn invalid(field: &str) -> Status {
    Status::invalid_argument(format!("missing {field} in request"))
}

fn parse_id<T: BaseId>(bytes: &[u8], what: &str) -> Result<T, Status> {
    T::from_binary(bytes)
        .map_err(|e| Status::invalid_argument(format!("bad {what}: {e}")))
}

#[tonic::async_trait]
impl NodeInfoGcs for GcsServer {
    async fn register_node(
        &self,
        request: Request<RegisterNodeParams>,
    ) -> Result<Response<RegisterNodeResult>, Status> {
        let node_info = request.into_inner().node_info.ok_or_else(|| invalid("node_info"))?;
        info!(
            "Received register node request for {}",
            hex_prefix(&node_info.node_id)
        );
        let (node, evicted) =
            self.node_manager().register_node(node_info).await.map_err(|e| {
                let msg = format!("Failed to register node: {e}");
                error!("{}", msg);
                Status::from(e)
            })?;
        let sender = self.event_sender();
        for stale in evicted {
            sender
                .post_event(GcsEvent::NodeRemoved(stale))
                .await
                .map_err(Status::from)?;
        }
        sender
            .post_event(GcsEvent::NodeAdded(node))
            .await
            .map_err(Status::from)?;
        Ok(Response::new(RegisterNodeResult {}))
    }

    async fn unregister_node(
        &self,
        request: Request<UnregisterNodeParams>,
    ) -> Result<Response<UnregisterNodeResult>, Status> {
        let node_id: NodeId =
            parse_id(&request.into_inner().node_id, "node id")?;
        info!("Received unregister node request for {}", node_id);
        self.event_sender()
            .post_event(GcsEvent::NodeFailure(node_id))
            .await
            .map_err(Status::from)?;
        Ok(Response::new(UnregisterNodeResult {}))
    }

    async fn get_all_node_info(
        &self,
        _request: Request<GetAllNodeInfoParams>,
    ) -> Result<Response<GetAllNodeInfoResult>, Status> {
        let node_info_list = self
            .node_manager()
            .get_all_nodes()
            .iter()
            .map(|node| (**node).clone())
            .collect();
        Ok(Response::new(GetAllNodeInfoResult { node_info_list }))
    }
}

#[tonic::async_trait]
impl HeartbeatInfoGcs for GcsServer {
    async fn report_heartbeat(
        &self,
        request: Request<ReportHeartbeatParams>,
    ) -> Result<Response<ReportHeartbeatResult>, Status> {
        let node_id: NodeId =
            parse_id(&request.into_inner().node_id, "node id")?;
        debug!("Received heartbeat from node {}", node_id);
        let known = self.heartbeat_manager().refresh(&node_id);
        Ok(Response::new(ReportHeartbeatResult { reregister: !known }))
    }
}

#[tonic::async_trait]
impl NodeResourceInfoGcs for GcsServer {
    async fn report_resource_usage(
        &self,
        request: Request<ReportResourceUsageParams>,
    ) -> Result<Response<ReportResourceUsageResult>, Status> {
        let resources = request
            .into_inner()
            .resources
            .ok_or_else(|| invalid("resources"))?;
        self.event_sender()
            .post_event(GcsEvent::ResourceReport(Box::new(resources)))
            .await
            .map_err(Status::from)?;
        Ok(Response::new(ReportResourceUsageResult {}))
    }

    async fn get_all_resource_usage(
        &self,
        _request: Request<GetAllResourceUsageParams>,
    ) -> Result<Response<GetAllResourceUsageResult>, Status> {
        let mut buffer = ResourceUsageBatchData::default();
        self.resource_manager()
            .get_resource_usage_batch_for_broadcast(&mut buffer);
        Ok(Response::new(GetAllResourceUsageResult {
            resource_usage_data: Some(buffer),
        }))
    }
}

#[tonic::async_trait]
impl JobInfoGcs for GcsServer {
    async fn add_job(
        &self,
        request: Request<AddJobParams>,
    ) -> Result<Response<AddJobResult>, Status> {
        let data = request.into_inner().data.ok_or_else(|| invalid("data"))?;
        self.job_manager().add_job(data).await.map_err(|e| {
            let msg = format!("Failed to add job: {e}");
            error!("{}", msg);
            Status::from(e)
        })?;
        Ok(Response::new(AddJobResult {}))
    }

    async fn mark_job_finished(
        &self,
        request: Request<MarkJobFinishedParams>,
    ) -> Result<Response<MarkJobFinishedResult>, Status> {
        let job_id: JobId = parse_id(&request.into_inner().job_id, "job id")?;
        let newly_finished = self
            .job_manager()
            .mark_job_finished(job_id)
            .await
            .map_err(Status::from)?;
        if newly_finished {
            // Listeners run after the table write committed.
            self.event_sender()
                .post_event(GcsEvent::JobFinished(job_id))
                .await
                .map_err(Status::from)?;
        }
        Ok(Response::new(MarkJobFinishedResult {}))
    }

    async fn get_all_job_info(
        &self,
        _request: Request<GetAllJobInfoParams>,
    ) -> Result<Response<GetAllJobInfoResult>, Status> {
        Ok(Response::new(GetAllJobInfoResult {
            job_info_list: self.job_manager().get_all_jobs(),
        }))
    }
}

#[tonic::async_trait]
impl ActorInfoGcs for GcsServer {
    async fn register_actor(
        &self,
        request: Request<RegisterActorParams>,
    ) -> Result<Response<RegisterActorResult>, Status> {
        let data = request.into_inner().data.ok_or_else(|| invalid("data"))?;
        self.actor_manager().register_actor(data).await.map_err(|e| {
            let msg = format!("Failed to register actor: {e}");
            error!("{}", msg);
            Status::from(e)
        })?;
        Ok(Response::new(RegisterActorResult {}))
    }

    async fn create_actor(
        &self,
        request: Request<CreateActorParams>,
    ) -> Result<Response<CreateActorResult>, Status> {
        let actor_id: ActorId =
            parse_id(&request.into_inner().actor_id, "actor id")?;
        let actor = self
            .actor_manager()
            .create_actor(actor_id)
            .await
            .map_err(Status::from)?;
        self.actor_scheduler()
            .schedule(&actor)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(CreateActorResult {}))
    }

    async fn get_actor_info(
        &self,
        request: Request<GetActorInfoParams>,
    ) -> Result<Response<GetActorInfoResult>, Status> {
        let actor_id: ActorId =
            parse_id(&request.into_inner().actor_id, "actor id")?;
        Ok(Response::new(GetActorInfoResult {
            actor_table_data: self.actor_manager().get_actor(&actor_id),
        }))
    }

    async fn get_named_actor_info(
        &self,
        request: Request<GetNamedActorInfoParams>,
    ) -> Result<Response<GetNamedActorInfoResult>, Status> {
        let GetNamedActorInfoParams {
            name,
            ray_namespace,
        } = request.into_inner();
        // An unknown name is an empty result, not an error.
        Ok(Response::new(GetNamedActorInfoResult {
            actor_table_data: self
                .actor_manager()
                .get_named_actor(&name, &ray_namespace),
        }))
    }

    async fn get_all_actor_info(
        &self,
        _request: Request<GetAllActorInfoParams>,
    ) -> Result<Response<GetAllActorInfoResult>, Status> {
        Ok(Response::new(GetAllActorInfoResult {
            actor_table_data: self.actor_manager().get_all_actors(),
        }))
    }

    async fn kill_actor_via_gcs(
        &self,
        request: Request<KillActorViaGcsParams>,
    ) -> Result<Response<KillActorViaGcsResult>, Status> {
        let KillActorViaGcsParams {
            actor_id,
            force_kill,
        } = request.into_inner();
        let actor_id: ActorId = parse_id(&actor_id, "actor id")?;
        info!("Received kill request for actor {}", actor_id);

        // Tell the hosting raylet first, best effort, while the actor's
        // placement is still known.
        if let Some(actor) = self.actor_manager().get_actor(&actor_id) {
            if let Ok(node_id) = NodeId::from_binary(&actor.node_id) {
                if let Ok(client) = self.client_pool().get(&node_id) {
                    let request = KillActorParams {
                        actor_id: actor_id.binary(),
                        force_kill,
                    };
                    tokio::spawn(async move {
                        if let Err(e) = client.kill_actor(request).await {
                            debug!("Kill RPC to raylet failed: {}", e);
                        }
                    });
                }
            }
        }

        self.actor_manager()
            .kill_actor(actor_id)
            .await
            .map_err(Status::from)?;
        self.event_sender()
            .post_event(GcsEvent::ActorDestroyed(actor_id))
            .await
            .map_err(Status::from)?;
        Ok(Response::new(KillActorViaGcsResult {}))
    }
}

#[tonic::async_trait]
impl PlacementGroupInfoGcs for GcsServer {
    async fn create_placement_group(
        &self,
        request: Request<CreatePlacementGroupParams>,
    ) -> Result<Response<CreatePlacementGroupResult>, Status> {
        let data = request.into_inner().data.ok_or_else(|| invalid("data"))?;
        self.placement_group_manager()
            .create_placement_group(data)
            .await
            .map_err(|e| {
                let msg = format!("Failed to create placement group: {e}");
                error!("{}", msg);
                Status::from(e)
            })?;
        if let Some(placement_group) =
            self.placement_group_manager().next_pending_placement_group()
        {
            self.placement_group_scheduler()
                .schedule(&placement_group)
                .await
                .map_err(Status::from)?;
        }
        Ok(Response::new(CreatePlacementGroupResult {}))
    }

    async fn remove_placement_group(
        &self,
        request: Request<RemovePlacementGroupParams>,
    ) -> Result<Response<RemovePlacementGroupResult>, Status> {
        let pg_id: PlacementGroupId =
            parse_id(&request.into_inner().placement_group_id, "placement group id")?;
        if let Some(before) = self
            .placement_group_manager()
            .remove_placement_group(pg_id)
            .await
            .map_err(Status::from)?
        {
            self.placement_group_scheduler()
                .cancel_committed_bundles(&before);
        }
        Ok(Response::new(RemovePlacementGroupResult {}))
    }

    async fn get_placement_group(
        &self,
        request: Request<GetPlacementGroupParams>,
    ) -> Result<Response<GetPlacementGroupResult>, Status> {
        let pg_id: PlacementGroupId =
            parse_id(&request.into_inner().placement_group_id, "placement group id")?;
        Ok(Response::new(GetPlacementGroupResult {
            placement_group_table_data: self
                .placement_group_manager()
                .get_placement_group(&pg_id),
        }))
    }

    async fn get_all_placement_group(
        &self,
        _request: Request<GetAllPlacementGroupParams>,
    ) -> Result<Response<GetAllPlacementGroupResult>, Status> {
        Ok(Response::new(GetAllPlacementGroupResult {
            placement_group_table_data: self
                .placement_group_manager()
                .get_all_placement_groups(),
        }))
    }
}

#[tonic::async_trait]
impl WorkerInfoGcs for GcsServer {
    async fn add_worker_info(
        &self,
        request: Request<AddWorkerInfoParams>,
    ) -> Result<Response<AddWorkerInfoResult>, Status> {
        let data = request.into_inner().data.ok_or_else(|| invalid("data"))?;
        self.worker_manager()
            .add_worker(data)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(AddWorkerInfoResult {}))
    }

    async fn report_worker_failure(
        &self,
        request: Request<ReportWorkerFailureParams>,
    ) -> Result<Response<ReportWorkerFailureResult>, Status> {
        let failure = request
            .into_inner()
            .worker_failure
            .ok_or_else(|| invalid("worker_failure"))?;
        if let Some(death) = self
            .worker_manager()
            .report_worker_failure(failure)
            .await
            .map_err(Status::from)?
        {
            self.event_sender()
                .post_event(GcsEvent::WorkerDead {
                    worker_id: death.worker_id,
                    node_id: death.node_id,
                    exit_type: death.exit_type,
                    creation_task_exception: death.creation_task_exception,
                })
                .await
                .map_err(Status::from)?;
        }
        Ok(Response::new(ReportWorkerFailureResult {}))
    }

    async fn get_worker_info(
        &self,
        request: Request<GetWorkerInfoParams>,
    ) -> Result<Response<GetWorkerInfoResult>, Status> {
        let worker_id: WorkerId =
            parse_id(&request.into_inner().worker_id, "worker id")?;
        Ok(Response::new(GetWorkerInfoResult {
            worker_table_data: self.worker_manager().get_worker(&worker_id),
        }))
    }
}

#[tonic::async_trait]
impl ObjectInfoGcs for GcsServer {
    async fn add_object_location(
        &self,
        request: Request<AddObjectLocationParams>,
    ) -> Result<Response<AddObjectLocationResult>, Status> {
        let params = request.into_inner();
        let object_id: ObjectId = parse_id(&params.object_id, "object id")?;
        let node_id: NodeId = parse_id(&params.node_id, "node id")?;
        let owner: WorkerId = parse_id(&params.owner_worker_id, "owner worker id")?;
        self.object_manager()
            .add_location(object_id, node_id, owner, params.size)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(AddObjectLocationResult {}))
    }

    async fn remove_object_location(
        &self,
        request: Request<RemoveObjectLocationParams>,
    ) -> Result<Response<RemoveObjectLocationResult>, Status> {
        let params = request.into_inner();
        let object_id: ObjectId = parse_id(&params.object_id, "object id")?;
        let node_id: NodeId = parse_id(&params.node_id, "node id")?;
        self.object_manager()
            .remove_location(object_id, node_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(RemoveObjectLocationResult {}))
    }

    async fn get_object_locations(
        &self,
        request: Request<GetObjectLocationsParams>,
    ) -> Result<Response<GetObjectLocationsResult>, Status> {
        let object_id: ObjectId =
            parse_id(&request.into_inner().object_id, "object id")?;
        Ok(Response::new(GetObjectLocationsResult {
            object_table_data: self.object_manager().get_locations(&object_id),
        }))
    }
}

#[tonic::async_trait]
impl InternalKvGcs for GcsServer {
    async fn internal_kv_get(
        &self,
        request: Request<InternalKvGetParams>,
    ) -> Result<Response<InternalKvGetResult>, Status> {
        let value = self
            .internal_kv()
            .get(&request.into_inner().key)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(InternalKvGetResult { value }))
    }

    async fn internal_kv_put(
        &self,
        request: Request<InternalKvPutParams>,
    ) -> Result<Response<InternalKvPutResult>, Status> {
        let InternalKvPutParams {
            key,
            value,
            overwrite,
        } = request.into_inner();
        let added = self
            .internal_kv()
            .put(&key, value, overwrite)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(InternalKvPutResult { added }))
    }

    async fn internal_kv_del(
        &self,
        request: Request<InternalKvDelParams>,
    ) -> Result<Response<InternalKvDelResult>, Status> {
        let deleted = self
            .internal_kv()
            .del(&request.into_inner().key)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(InternalKvDelResult { deleted }))
    }

    async fn internal_kv_exists(
        &self,
        request: Request<InternalKvExistsParams>,
    ) -> Result<Response<InternalKvExistsResult>, Status> {
        let exists = self
            .internal_kv()
            .exists(&request.into_inner().key)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(InternalKvExistsResult { exists }))
    }

    async fn internal_kv_keys(
        &self,
        request: Request<InternalKvKeysParams>,
    ) -> Result<Response<InternalKvKeysResult>, Status> {
        let keys = self
            .internal_kv()
            .keys(&request.into_inner().prefix)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(InternalKvKeysResult { keys }))
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}
