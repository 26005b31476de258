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

//! Wire and persistence schema. Field tags and enum values are frozen:
//! records written by one server generation must replay on the next, so
//! tags are never reused and enum values are never renumbered.

use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Entity records
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum GcsNodeState {
    Alive = 0,
    Dead = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeAddress {
    #[prost(string, tag = "1")]
    pub ip: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GcsNodeInfo {
    #[prost(bytes = "vec", tag = "1")]
    pub node_id: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub address: Option<NodeAddress>,
    #[prost(map = "string, double", tag = "3")]
    pub resources_total: HashMap<String, f64>,
    #[prost(enumeration = "GcsNodeState", tag = "4")]
    pub state: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum JobState {
    Running = 0,
    Finished = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobTableData {
    #[prost(bytes = "vec", tag = "1")]
    pub job_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub ray_namespace: String,
    #[prost(message, optional, tag = "3")]
    pub driver_address: Option<NodeAddress>,
    #[prost(enumeration = "JobState", tag = "4")]
    pub state: i32,
    /// Opaque job configuration blob, replayed to restarting drivers.
    #[prost(bytes = "vec", tag = "5")]
    pub config: Vec<u8>,
}

/// An application-level exception captured from a failed creation task,
/// stored verbatim and surfaced to subscribers and `Get` callers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RayException {
    #[prost(string, tag = "1")]
    pub error_message: String,
    #[prost(string, tag = "2")]
    pub formatted_exception: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ActorState {
    DependenciesUnready = 0,
    PendingCreation = 1,
    Alive = 2,
    Restarting = 3,
    Dead = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActorTableData {
    #[prost(bytes = "vec", tag = "1")]
    pub actor_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub job_id: Vec<u8>,
    #[prost(enumeration = "ActorState", tag = "3")]
    pub state: i32,
    #[prost(map = "string, double", tag = "4")]
    pub required_resources: HashMap<String, f64>,
    /// -1 means unlimited restarts.
    #[prost(int64, tag = "5")]
    pub max_restarts: i64,
    #[prost(uint64, tag = "6")]
    pub num_restarts: u64,
    /// Assigned node; empty until the actor is scheduled.
    #[prost(bytes = "vec", tag = "7")]
    pub node_id: Vec<u8>,
    /// Assigned worker; empty until creation succeeds.
    #[prost(bytes = "vec", tag = "8")]
    pub worker_id: Vec<u8>,
    #[prost(string, tag = "9")]
    pub name: String,
    #[prost(string, tag = "10")]
    pub ray_namespace: String,
    #[prost(bool, tag = "11")]
    pub is_detached: bool,
    #[prost(bytes = "vec", tag = "12")]
    pub placement_group_id: Vec<u8>,
    #[prost(message, optional, tag = "13")]
    pub creation_task_exception: Option<RayException>,
    #[prost(string, tag = "14")]
    pub death_reason: String,
}

impl ActorTableData {
    /// Restarts still available, `u64::MAX` when unlimited.
    pub fn remaining_restarts(&self) -> u64 {
        if self.max_restarts < 0 {
            u64::MAX
        } else {
            (self.max_restarts as u64).saturating_sub(self.num_restarts)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum BundleState {
    Unscheduled = 0,
    Pending = 1,
    Placed = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Bundle {
    #[prost(uint32, tag = "1")]
    pub bundle_index: u32,
    #[prost(map = "string, double", tag = "2")]
    pub unit_resources: HashMap<String, f64>,
    /// Node this bundle is placed on; empty while unscheduled.
    #[prost(bytes = "vec", tag = "3")]
    pub node_id: Vec<u8>,
    #[prost(enumeration = "BundleState", tag = "4")]
    pub state: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PlacementStrategy {
    Pack = 0,
    Spread = 1,
    StrictPack = 2,
    StrictSpread = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PlacementGroupState {
    Pending = 0,
    Created = 1,
    Removed = 2,
    Rescheduling = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlacementGroupTableData {
    #[prost(bytes = "vec", tag = "1")]
    pub placement_group_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "3")]
    pub bundles: Vec<Bundle>,
    #[prost(enumeration = "PlacementStrategy", tag = "4")]
    pub strategy: i32,
    #[prost(enumeration = "PlacementGroupState", tag = "5")]
    pub state: i32,
    #[prost(bytes = "vec", tag = "6")]
    pub creator_job_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub creator_actor_id: Vec<u8>,
    #[prost(bool, tag = "8")]
    pub is_detached: bool,
    #[prost(string, tag = "9")]
    pub ray_namespace: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WorkerExitType {
    IdleExit = 0,
    IntendedExit = 1,
    UnexpectedSystemExit = 2,
    CreationTaskFailed = 3,
    NodeDied = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerTableData {
    #[prost(bytes = "vec", tag = "1")]
    pub worker_id: Vec<u8>,
    /// The raylet this worker belongs to.
    #[prost(bytes = "vec", tag = "2")]
    pub node_id: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub is_alive: bool,
    #[prost(enumeration = "WorkerExitType", tag = "4")]
    pub exit_type: i32,
    #[prost(message, optional, tag = "5")]
    pub creation_task_exception: Option<RayException>,
    #[prost(uint32, tag = "6")]
    pub pid: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectTableData {
    #[prost(bytes = "vec", tag = "1")]
    pub object_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub owner_worker_id: Vec<u8>,
    /// Nodes currently holding a copy.
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub locations: Vec<Vec<u8>>,
    #[prost(uint64, tag = "4")]
    pub size: u64,
}

/// One node's resource report. `sequence` is assigned by the raylet and is
/// strictly increasing per node; the resource manager drops anything older
/// than what it has already applied.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourcesData {
    #[prost(bytes = "vec", tag = "1")]
    pub node_id: Vec<u8>,
    #[prost(map = "string, double", tag = "2")]
    pub resources_total: HashMap<String, f64>,
    #[prost(map = "string, double", tag = "3")]
    pub resources_available: HashMap<String, f64>,
    #[prost(map = "string, double", tag = "4")]
    pub resource_load: HashMap<String, f64>,
    #[prost(uint64, tag = "5")]
    pub object_store_bytes_used: u64,
    #[prost(uint64, tag = "6")]
    pub sequence: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceUsageBatchData {
    #[prost(message, repeated, tag = "1")]
    pub batch: Vec<ResourcesData>,
}

/// A single pub/sub publication: channel plus the id it is keyed on.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PubSubMessage {
    #[prost(string, tag = "1")]
    pub channel: String,
    #[prost(bytes = "vec", tag = "2")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Node info service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterNodeParams {
    #[prost(message, optional, tag = "1")]
    pub node_info: Option<GcsNodeInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterNodeResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnregisterNodeParams {
    #[prost(bytes = "vec", tag = "1")]
    pub node_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnregisterNodeResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllNodeInfoParams {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllNodeInfoResult {
    #[prost(message, repeated, tag = "1")]
    pub node_info_list: Vec<GcsNodeInfo>,
}

// ---------------------------------------------------------------------------
// Heartbeat service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportHeartbeatParams {
    #[prost(bytes = "vec", tag = "1")]
    pub node_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportHeartbeatResult {
    /// Set when the node is unknown to the failure detector and must
    /// register again before its heartbeats count.
    #[prost(bool, tag = "1")]
    pub reregister: bool,
}

// ---------------------------------------------------------------------------
// Node resource service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportResourceUsageParams {
    #[prost(message, optional, tag = "1")]
    pub resources: Option<ResourcesData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportResourceUsageResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllResourceUsageParams {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllResourceUsageResult {
    #[prost(message, optional, tag = "1")]
    pub resource_usage_data: Option<ResourceUsageBatchData>,
}

// ---------------------------------------------------------------------------
// Job info service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddJobParams {
    #[prost(message, optional, tag = "1")]
    pub data: Option<JobTableData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddJobResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkJobFinishedParams {
    #[prost(bytes = "vec", tag = "1")]
    pub job_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkJobFinishedResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllJobInfoParams {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllJobInfoResult {
    #[prost(message, repeated, tag = "1")]
    pub job_info_list: Vec<JobTableData>,
}

// ---------------------------------------------------------------------------
// Actor info service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterActorParams {
    #[prost(message, optional, tag = "1")]
    pub data: Option<ActorTableData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterActorResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateActorParams {
    #[prost(bytes = "vec", tag = "1")]
    pub actor_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateActorResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetActorInfoParams {
    #[prost(bytes = "vec", tag = "1")]
    pub actor_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetActorInfoResult {
    #[prost(message, optional, tag = "1")]
    pub actor_table_data: Option<ActorTableData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetNamedActorInfoParams {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub ray_namespace: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetNamedActorInfoResult {
    #[prost(message, optional, tag = "1")]
    pub actor_table_data: Option<ActorTableData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllActorInfoParams {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllActorInfoResult {
    #[prost(message, repeated, tag = "1")]
    pub actor_table_data: Vec<ActorTableData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KillActorViaGcsParams {
    #[prost(bytes = "vec", tag = "1")]
    pub actor_id: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub force_kill: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KillActorViaGcsResult {}

// ---------------------------------------------------------------------------
// Placement group service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreatePlacementGroupParams {
    #[prost(message, optional, tag = "1")]
    pub data: Option<PlacementGroupTableData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreatePlacementGroupResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemovePlacementGroupParams {
    #[prost(bytes = "vec", tag = "1")]
    pub placement_group_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemovePlacementGroupResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPlacementGroupParams {
    #[prost(bytes = "vec", tag = "1")]
    pub placement_group_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPlacementGroupResult {
    #[prost(message, optional, tag = "1")]
    pub placement_group_table_data: Option<PlacementGroupTableData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllPlacementGroupParams {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllPlacementGroupResult {
    #[prost(message, repeated, tag = "1")]
    pub placement_group_table_data: Vec<PlacementGroupTableData>,
}

// ---------------------------------------------------------------------------
// Worker info service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddWorkerInfoParams {
    #[prost(message, optional, tag = "1")]
    pub data: Option<WorkerTableData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddWorkerInfoResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportWorkerFailureParams {
    #[prost(message, optional, tag = "1")]
    pub worker_failure: Option<WorkerTableData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportWorkerFailureResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetWorkerInfoParams {
    #[prost(bytes = "vec", tag = "1")]
    pub worker_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetWorkerInfoResult {
    #[prost(message, optional, tag = "1")]
    pub worker_table_data: Option<WorkerTableData>,
}

// ---------------------------------------------------------------------------
// Object info service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddObjectLocationParams {
    #[prost(bytes = "vec", tag = "1")]
    pub object_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub node_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub owner_worker_id: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub size: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddObjectLocationResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveObjectLocationParams {
    #[prost(bytes = "vec", tag = "1")]
    pub object_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub node_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveObjectLocationResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetObjectLocationsParams {
    #[prost(bytes = "vec", tag = "1")]
    pub object_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetObjectLocationsResult {
    #[prost(message, optional, tag = "1")]
    pub object_table_data: Option<ObjectTableData>,
}

// ---------------------------------------------------------------------------
// Internal KV service
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalKvGetParams {
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalKvGetResult {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub value: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalKvPutParams {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub overwrite: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalKvPutResult {
    #[prost(bool, tag = "1")]
    pub added: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalKvDelParams {
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalKvDelResult {
    #[prost(bool, tag = "1")]
    pub deleted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalKvExistsParams {
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalKvExistsResult {
    #[prost(bool, tag = "1")]
    pub exists: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalKvKeysParams {
    #[prost(string, tag = "1")]
    pub prefix: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InternalKvKeysResult {
    #[prost(string, repeated, tag = "1")]
    pub keys: Vec<String>,
}

// ---------------------------------------------------------------------------
// Raylet-facing messages (GCS as client)
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestResourceReportParams {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestResourceReportResult {
    #[prost(message, optional, tag = "1")]
    pub resources: Option<ResourcesData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateResourceUsageParams {
    #[prost(message, optional, tag = "1")]
    pub batch: Option<ResourceUsageBatchData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateResourceUsageResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateActorOnRayletParams {
    #[prost(message, optional, tag = "1")]
    pub actor: Option<ActorTableData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateActorOnRayletResult {
    /// Worker the actor was created on; empty means creation failed.
    #[prost(bytes = "vec", tag = "1")]
    pub worker_id: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub creation_task_exception: Option<RayException>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrepareBundleResourcesParams {
    #[prost(bytes = "vec", tag = "1")]
    pub placement_group_id: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub bundles: Vec<Bundle>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrepareBundleResourcesResult {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitBundleResourcesParams {
    #[prost(bytes = "vec", tag = "1")]
    pub placement_group_id: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub bundles: Vec<Bundle>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitBundleResourcesResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelResourceReserveParams {
    #[prost(bytes = "vec", tag = "1")]
    pub placement_group_id: Vec<u8>,
    #[prost(uint32, repeated, tag = "2")]
    pub bundle_indexes: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelResourceReserveResult {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KillActorParams {
    #[prost(bytes = "vec", tag = "1")]
    pub actor_id: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub force_kill: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KillActorResult {}
