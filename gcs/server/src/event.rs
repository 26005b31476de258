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

//! Events carried on the main loop. Managers never call each other; they
//! return facts to their caller, and the server's event processor turns
//! those facts into the fixed cross-manager cascades.

use std::sync::Arc;

use gcs_core::ids::{ActorId, JobId, NodeId, PlacementGroupId, WorkerId};
use gcs_core::serde::protobuf::{
    GcsNodeInfo, RayException, ResourcesData, WorkerExitType,
};

#[derive(Clone)]
pub enum GcsEvent {
    /// A raylet registered and is now in the alive set.
    NodeAdded(Arc<GcsNodeInfo>),
    /// A node must be declared dead (heartbeat expiry or admin request).
    NodeFailure(NodeId),
    /// A node already transitioned to DEAD; run the removal cascade for it.
    NodeRemoved(Arc<GcsNodeInfo>),
    /// A resource report arrived, from the poller or a push RPC.
    ResourceReport(Box<ResourcesData>),
    /// A worker died; precedes any actor death it causes.
    WorkerDead {
        worker_id: WorkerId,
        node_id: NodeId,
        exit_type: WorkerExitType,
        creation_task_exception: Option<RayException>,
    },
    /// A job committed its FINISHED state.
    JobFinished(JobId),
    /// The creation RPC for an actor succeeded on its raylet.
    ActorCreationSucceeded {
        actor_id: ActorId,
        node_id: NodeId,
        worker_id: WorkerId,
    },
    /// The creation attempt failed: no feasible node, a transport error, or
    /// an application exception thrown by the creation task.
    ActorCreationFailed {
        actor_id: ActorId,
        creation_task_exception: Option<RayException>,
    },
    /// An actor reached DEAD; placement groups it created may need cleanup.
    ActorDestroyed(ActorId),
    /// Every bundle of the placement group was prepared and committed.
    PlacementGroupSchedulingSucceeded {
        placement_group_id: PlacementGroupId,
        placements: Vec<(u32, NodeId)>,
    },
    /// The scheduling attempt failed as a whole; the group stays PENDING
    /// (or RESCHEDULING) and is retried when the cluster changes.
    PlacementGroupSchedulingFailed {
        placement_group_id: PlacementGroupId,
        placements: Vec<(u32, NodeId)>,
    },
}

impl GcsEvent {
    /// Stable label for the event-stats print.
    pub fn label(&self) -> &'static str {
        match self {
            GcsEvent::NodeAdded(_) => "NodeAdded",
            GcsEvent::NodeFailure(_) => "NodeFailure",
            GcsEvent::NodeRemoved(_) => "NodeRemoved",
            GcsEvent::ResourceReport(_) => "ResourceReport",
            GcsEvent::WorkerDead { .. } => "WorkerDead",
            GcsEvent::JobFinished(_) => "JobFinished",
            GcsEvent::ActorCreationSucceeded { .. } => "ActorCreationSucceeded",
            GcsEvent::ActorCreationFailed { .. } => "ActorCreationFailed",
            GcsEvent::ActorDestroyed(_) => "ActorDestroyed",
            GcsEvent::PlacementGroupSchedulingSucceeded { .. } => {
                "PlacementGroupSchedulingSucceeded"
            }
            GcsEvent::PlacementGroupSchedulingFailed { .. } => {
                "PlacementGroupSchedulingFailed"
            }
        }
    }
}
