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

//! Ownership and location index for large objects. Not authoritative for
//! the bytes themselves; raylets hold those.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use gcs_core::error::Result;
use gcs_core::ids::{BaseId, NodeId, ObjectId, WorkerId};
use gcs_core::serde::encode_protobuf;
use gcs_core::serde::protobuf::ObjectTableData;

use crate::init_data::GcsInitData;
use crate::pubsub::{GcsPublisher, OBJECT_CHANNEL};
use crate::storage::GcsTableStorage;

#[derive(Default)]
struct ObjectIndexes {
    objects: HashMap<ObjectId, ObjectTableData>,
    by_owner: HashMap<WorkerId, HashSet<ObjectId>>,
    by_node: HashMap<NodeId, HashSet<ObjectId>>,
}

pub struct ObjectManager {
    indexes: RwLock<ObjectIndexes>,
    storage: Arc<GcsTableStorage>,
    publisher: Arc<dyn GcsPublisher>,
}

impl ObjectManager {
    pub fn new(storage: Arc<GcsTableStorage>, publisher: Arc<dyn GcsPublisher>) -> Self {
        Self {
            indexes: RwLock::new(ObjectIndexes::default()),
            storage,
            publisher,
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        let mut indexes = self.indexes.write();
        for (object_id, object) in &init_data.objects {
            Self::index_object(&mut indexes, *object_id, object.clone());
        }
    }

    fn index_object(
        indexes: &mut ObjectIndexes,
        object_id: ObjectId,
        object: ObjectTableData,
    ) {
        if let Ok(owner) = WorkerId::from_binary(&object.owner_worker_id) {
            indexes.by_owner.entry(owner).or_default().insert(object_id);
        }
        for location in &object.locations {
            if let Ok(node_id) = NodeId::from_binary(location) {
                indexes
                    .by_node
                    .entry(node_id)
                    .or_default()
                    .insert(object_id);
            }
        }
        indexes.objects.insert(object_id, object);
    }

    pub async fn add_location(
        &self,
        object_id: ObjectId,
        node_id: NodeId,
        owner_worker_id: WorkerId,
        size: u64,
    ) -> Result<()> {
        let object = {
            let mut indexes = self.indexes.write();
            let object = indexes.objects.entry(object_id).or_insert_with(|| {
                ObjectTableData {
                    object_id: object_id.binary(),
                    owner_worker_id: owner_worker_id.binary(),
                    size,
                    ..Default::default()
                }
            });
            if !object.locations.iter().any(|l| l == node_id.as_bytes()) {
                object.locations.push(node_id.binary());
            }
            let object = object.clone();
            indexes
                .by_owner
                .entry(owner_worker_id)
                .or_default()
                .insert(object_id);
            indexes.by_node.entry(node_id).or_default().insert(object_id);
            object
        };
        self.persist_and_publish(object_id, &object).await
    }

    pub async fn remove_location(
        &self,
        object_id: ObjectId,
        node_id: NodeId,
    ) -> Result<()> {
        let object = {
            let mut indexes = self.indexes.write();
            if let Some(set) = indexes.by_node.get_mut(&node_id) {
                set.remove(&object_id);
            }
            match indexes.objects.get_mut(&object_id) {
                Some(object) => {
                    object.locations.retain(|l| l != node_id.as_bytes());
                    object.clone()
                }
                None => return Ok(()),
            }
        };
        self.persist_and_publish(object_id, &object).await
    }

    /// Evict every location on a dead node and notify per affected object.
    pub async fn on_node_dead(&self, node_id: &NodeId) -> Result<()> {
        let affected: Vec<(ObjectId, ObjectTableData)> = {
            let mut indexes = self.indexes.write();
            let Some(object_ids) = indexes.by_node.remove(node_id) else {
                return Ok(());
            };
            object_ids
                .into_iter()
                .filter_map(|object_id| {
                    indexes.objects.get_mut(&object_id).map(|object| {
                        object.locations.retain(|l| l != node_id.as_bytes());
                        (object_id, object.clone())
                    })
                })
                .collect()
        };
        debug!(
            "Evicting {} object locations from dead node {}",
            affected.len(),
            node_id
        );
        for (object_id, object) in affected {
            self.persist_and_publish(object_id, &object).await?;
        }
        Ok(())
    }

    async fn persist_and_publish(
        &self,
        object_id: ObjectId,
        object: &ObjectTableData,
    ) -> Result<()> {
        self.storage.object_table().put(&object_id, object).await?;
        self.publisher
            .publish(
                OBJECT_CHANNEL,
                object_id.as_bytes(),
                encode_protobuf(object),
            )
            .await
    }

    pub fn get_locations(&self, object_id: &ObjectId) -> Option<ObjectTableData> {
        self.indexes.read().objects.get(object_id).cloned()
    }

    pub fn objects_owned_by(&self, worker_id: &WorkerId) -> Vec<ObjectId> {
        self.indexes
            .read()
            .by_owner
            .get(worker_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn debug_string(&self) -> String {
        let indexes = self.indexes.read();
        format!(
            "ObjectManager {{ objects: {}, owners: {} }}",
            indexes.objects.len(),
            indexes.by_owner.len()
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

    fn manager() -> ObjectManager {
        let storage = Arc::new(GcsTableStorage::new(
            Arc::new(MemoryKvStore::new()),
            RetryPolicy::new(1, 3),
        ));
        let publisher = Arc::new(DirectPublisher::new(Duration::from_secs(10), 100));
        ObjectManager::new(storage, publisher)
    }

    #[tokio::test]
    async fn add_remove_location_round_trip() {
        let manager = manager();
        let object_id = ObjectId::from_random();
        let owner = WorkerId::from_random();
        let node_a = NodeId::from_random();
        let node_b = NodeId::from_random();

        manager
            .add_location(object_id, node_a, owner, 1024)
            .await
            .unwrap();
        manager
            .add_location(object_id, node_b, owner, 1024)
            .await
            .unwrap();
        assert_eq!(
            manager.get_locations(&object_id).unwrap().locations.len(),
            2
        );
        assert_eq!(manager.objects_owned_by(&owner), vec![object_id]);

        manager.remove_location(object_id, node_a).await.unwrap();
        let object = manager.get_locations(&object_id).unwrap();
        assert_eq!(object.locations, vec![node_b.binary()]);
    }

    #[tokio::test]
    async fn node_death_evicts_its_locations() {
        let manager = manager();
        let owner = WorkerId::from_random();
        let dead_node = NodeId::from_random();
        let alive_node = NodeId::from_random();
        let on_both = ObjectId::from_random();
        let only_dead = ObjectId::from_random();

        manager
            .add_location(on_both, dead_node, owner, 1)
            .await
            .unwrap();
        manager
            .add_location(on_both, alive_node, owner, 1)
            .await
            .unwrap();
        manager
            .add_location(only_dead, dead_node, owner, 1)
            .await
            .unwrap();

        manager.on_node_dead(&dead_node).await.unwrap();
        assert_eq!(
            manager.get_locations(&on_both).unwrap().locations,
            vec![alive_node.binary()]
        );
        assert!(manager
            .get_locations(&only_dead)
            .unwrap()
            .locations
            .is_empty());
    }
}
