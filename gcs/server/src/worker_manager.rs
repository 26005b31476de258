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
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use gcs_core::error::Result;
use gcs_core::ids::{BaseId, NodeId, WorkerId};
use gcs_core::serde::encode_protobuf;
use gcs_core::serde::protobuf::{RayException, WorkerExitType, WorkerTableData};

use crate::init_data::GcsInitData;
use crate::pubsub::{GcsPublisher, WORKER_CHANNEL};
use crate::storage::GcsTableStorage;

/// The fact a worker-failure report commits; the server turns it into the
/// WorkerDead cascade (actors first, per the data-model ordering).
pub struct WorkerDeath {
    pub worker_id: WorkerId,
    pub node_id: NodeId,
    pub exit_type: WorkerExitType,
    pub creation_task_exception: Option<RayException>,
}

pub struct WorkerManager {
    workers: RwLock<HashMap<WorkerId, WorkerTableData>>,
    storage: Arc<GcsTableStorage>,
    publisher: Arc<dyn GcsPublisher>,
}

impl WorkerManager {
    pub fn new(storage: Arc<GcsTableStorage>, publisher: Arc<dyn GcsPublisher>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            storage,
            publisher,
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        self.workers.write().extend(
            init_data
                .workers
                .iter()
                .map(|(worker_id, worker)| (*worker_id, worker.clone())),
        );
    }

    pub async fn add_worker(&self, worker: WorkerTableData) -> Result<()> {
        let worker_id = WorkerId::from_binary(&worker.worker_id)?;
        self.storage.worker_table().put(&worker_id, &worker).await?;
        self.workers.write().insert(worker_id, worker);
        Ok(())
    }

    /// Record a worker death. Returns `None` when the death was already
    /// recorded, so the cascade runs at most once per worker.
    pub async fn report_worker_failure(
        &self,
        mut failure: WorkerTableData,
    ) -> Result<Option<WorkerDeath>> {
        let worker_id = WorkerId::from_binary(&failure.worker_id)?;
        let node_id = NodeId::from_binary(&failure.node_id)?;
        if let Some(existing) = self.workers.read().get(&worker_id) {
            if !existing.is_alive {
                warn!("Worker {} death reported twice, ignoring", worker_id);
                return Ok(None);
            }
        }
        failure.is_alive = false;
        self.storage.worker_table().put(&worker_id, &failure).await?;
        self.publisher
            .publish(
                WORKER_CHANNEL,
                worker_id.as_bytes(),
                encode_protobuf(&failure),
            )
            .await?;
        let death = WorkerDeath {
            worker_id,
            node_id,
            exit_type: failure.exit_type(),
            creation_task_exception: failure.creation_task_exception.clone(),
        };
        info!(
            "Worker {} on node {} is dead ({:?})",
            worker_id,
            node_id,
            failure.exit_type()
        );
        self.workers.write().insert(worker_id, failure);
        Ok(Some(death))
    }

    pub fn get_worker(&self, worker_id: &WorkerId) -> Option<WorkerTableData> {
        self.workers.read().get(worker_id).cloned()
    }

    pub fn debug_string(&self) -> String {
        let workers = self.workers.read();
        let alive = workers.values().filter(|worker| worker.is_alive).count();
        format!(
            "WorkerManager {{ workers: {}, alive: {} }}",
            workers.len(),
            alive
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

    fn manager() -> WorkerManager {
        let storage = Arc::new(GcsTableStorage::new(
            Arc::new(MemoryKvStore::new()),
            RetryPolicy::new(1, 3),
        ));
        let publisher = Arc::new(DirectPublisher::new(Duration::from_secs(10), 100));
        WorkerManager::new(storage, publisher)
    }

    #[tokio::test]
    async fn failure_report_carries_exception_and_is_exactly_once() {
        let manager = manager();
        let worker_id = WorkerId::from_random();
        let node_id = NodeId::from_random();
        manager
            .add_worker(WorkerTableData {
                worker_id: worker_id.binary(),
                node_id: node_id.binary(),
                is_alive: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let failure = WorkerTableData {
            worker_id: worker_id.binary(),
            node_id: node_id.binary(),
            is_alive: false,
            exit_type: WorkerExitType::CreationTaskFailed as i32,
            creation_task_exception: Some(RayException {
                error_message: "boom".to_owned(),
                formatted_exception: "ValueError: boom".to_owned(),
            }),
            ..Default::default()
        };
        let death = manager
            .report_worker_failure(failure.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(death.worker_id, worker_id);
        assert_eq!(death.node_id, node_id);
        assert_eq!(death.exit_type, WorkerExitType::CreationTaskFailed);
        assert_eq!(
            death.creation_task_exception.unwrap().error_message,
            "boom"
        );

        // A duplicate report produces no second cascade.
        assert!(manager
            .report_worker_failure(failure)
            .await
            .unwrap()
            .is_none());
    }
}
