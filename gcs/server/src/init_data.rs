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

use std::collections::HashMap;

use gcs_core::error::Result;
use gcs_core::ids::{ActorId, JobId, NodeId, ObjectId, PlacementGroupId, WorkerId};
use gcs_core::serde::protobuf::{
    ActorTableData, GcsNodeInfo, JobTableData, ObjectTableData,
    PlacementGroupTableData, WorkerTableData,
};

use crate::storage::GcsTableStorage;

/// Snapshot of every table, loaded in parallel before any manager starts
/// serving. Managers initialize from this and never read the tables again
/// except to write.
#[derive(Default)]
pub struct GcsInitData {
    pub nodes: HashMap<NodeId, GcsNodeInfo>,
    pub jobs: HashMap<JobId, JobTableData>,
    pub actors: HashMap<ActorId, ActorTableData>,
    pub placement_groups: HashMap<PlacementGroupId, PlacementGroupTableData>,
    pub workers: HashMap<WorkerId, WorkerTableData>,
    pub objects: HashMap<ObjectId, ObjectTableData>,
}

impl GcsInitData {
    pub async fn load(storage: &GcsTableStorage) -> Result<Self> {
        let (nodes, jobs, actors, placement_groups, workers, objects) = futures::try_join!(
            storage.node_table().get_all(),
            storage.job_table().get_all(),
            storage.actor_table().get_all(),
            storage.placement_group_table().get_all(),
            storage.worker_table().get_all(),
            storage.object_table().get_all(),
        )?;
        Ok(Self {
            nodes,
            jobs,
            actors,
            placement_groups,
            workers,
            objects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use gcs_core::ids::BaseId;
    use gcs_core::serde::protobuf::GcsNodeState;

    use crate::storage::kv::MemoryKvStore;
    use crate::storage::RetryPolicy;

    #[tokio::test]
    async fn load_returns_the_persisted_snapshot() {
        let storage =
            GcsTableStorage::new(Arc::new(MemoryKvStore::new()), RetryPolicy::new(1, 3));

        let node_id = NodeId::from_random();
        let mut node = GcsNodeInfo {
            node_id: node_id.binary(),
            ..Default::default()
        };
        node.set_state(GcsNodeState::Alive);
        storage.node_table().put(&node_id, &node).await.unwrap();

        let job_id = JobId::from_random();
        let job = JobTableData {
            job_id: job_id.binary(),
            ray_namespace: "ns".to_owned(),
            ..Default::default()
        };
        storage.job_table().put(&job_id, &job).await.unwrap();

        let init_data = GcsInitData::load(&storage).await.unwrap();
        assert_eq!(init_data.nodes.len(), 1);
        assert_eq!(init_data.nodes[&node_id], node);
        assert_eq!(init_data.jobs[&job_id], job);
        assert!(init_data.actors.is_empty());
    }
}
