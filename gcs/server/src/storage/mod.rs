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

//! Typed tables over the backing store, one per entity kind. Values are
//! prost-encoded records keyed by the entity's binary id. Writes are durable
//! before the call returns; transient store errors are retried with
//! exponential backoff up to a bounded budget.

pub mod kv;

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use prost::Message;

use gcs_core::error::Result;
use gcs_core::ids::{
    ActorId, BaseId, JobId, NodeId, ObjectId, PlacementGroupId, WorkerId,
};
use gcs_core::serde::protobuf::{
    ActorTableData, GcsNodeInfo, JobTableData, ObjectTableData,
    PlacementGroupTableData, WorkerTableData,
};
use gcs_core::serde::{decode_protobuf, encode_protobuf};

use kv::KvStoreClient;

pub const NODE_TABLE: &str = "NODE";
pub const JOB_TABLE: &str = "JOB";
pub const ACTOR_TABLE: &str = "ACTOR";
pub const PLACEMENT_GROUP_TABLE: &str = "PLACEMENT_GROUP";
pub const WORKER_TABLE: &str = "WORKER";
pub const OBJECT_TABLE: &str = "OBJECT";
/// Reserved key family for the internal KV surface and the server address.
pub const INTERNAL_KV_TABLE: &str = "INTERNAL";

/// Reserved key under [`INTERNAL_KV_TABLE`] holding the advertised GCS
/// address. Written after serving starts, never deleted on stop so a
/// restarting server remains discoverable.
pub const GCS_SERVER_ADDRESS_KEY: &[u8] = b"GcsServerAddress";

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::from_millis(base_delay_ms),
            max_attempts,
        }
    }
}

/// Run `op` until it succeeds, the error is not transient, or the attempt
/// budget runs out. The last error is surfaced to the caller either way.
pub(crate) async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                warn!(
                    "Retrying storage operation after transient error (attempt {}): {}",
                    attempt, e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A typed view over one backing-store table.
pub struct GcsTable<K, V> {
    store: Arc<dyn KvStoreClient>,
    table_name: &'static str,
    retry: RetryPolicy,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> GcsTable<K, V>
where
    K: BaseId,
    V: Message + Default + Clone,
{
    fn new(
        store: Arc<dyn KvStoreClient>,
        table_name: &'static str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            table_name,
            retry,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.table_name
    }

    pub async fn put(&self, id: &K, value: &V) -> Result<()> {
        let bytes = encode_protobuf(value);
        with_retry(self.retry, || {
            self.store.put(self.table_name, id.as_bytes(), bytes.clone())
        })
        .await
    }

    pub async fn get(&self, id: &K) -> Result<Option<V>> {
        let bytes =
            with_retry(self.retry, || self.store.get(self.table_name, id.as_bytes()))
                .await?;
        bytes.map(|b| decode_protobuf(&b)).transpose()
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, id: &K) -> Result<bool> {
        with_retry(self.retry, || {
            self.store.delete(self.table_name, id.as_bytes())
        })
        .await
    }

    pub async fn batch_delete(&self, ids: &[K]) -> Result<()> {
        let keys: Vec<Vec<u8>> = ids.iter().map(|id| id.binary()).collect();
        with_retry(self.retry, || self.store.batch_delete(self.table_name, &keys))
            .await
    }

    pub async fn get_all(&self) -> Result<HashMap<K, V>> {
        let rows =
            with_retry(self.retry, || self.store.get_all(self.table_name)).await?;
        let mut result = HashMap::with_capacity(rows.len());
        for (key, value) in rows {
            let id = K::from_binary(&key)?;
            result.insert(id, decode_protobuf(&value)?);
        }
        Ok(result)
    }
}

/// All typed tables plus the shared store handle.
pub struct GcsTableStorage {
    store: Arc<dyn KvStoreClient>,
    node_table: GcsTable<NodeId, GcsNodeInfo>,
    job_table: GcsTable<JobId, JobTableData>,
    actor_table: GcsTable<ActorId, ActorTableData>,
    placement_group_table: GcsTable<PlacementGroupId, PlacementGroupTableData>,
    worker_table: GcsTable<WorkerId, WorkerTableData>,
    object_table: GcsTable<ObjectId, ObjectTableData>,
}

impl GcsTableStorage {
    pub fn new(store: Arc<dyn KvStoreClient>, retry: RetryPolicy) -> Self {
        Self {
            node_table: GcsTable::new(store.clone(), NODE_TABLE, retry),
            job_table: GcsTable::new(store.clone(), JOB_TABLE, retry),
            actor_table: GcsTable::new(store.clone(), ACTOR_TABLE, retry),
            placement_group_table: GcsTable::new(
                store.clone(),
                PLACEMENT_GROUP_TABLE,
                retry,
            ),
            worker_table: GcsTable::new(store.clone(), WORKER_TABLE, retry),
            object_table: GcsTable::new(store.clone(), OBJECT_TABLE, retry),
            store,
        }
    }

    pub fn store(&self) -> Arc<dyn KvStoreClient> {
        self.store.clone()
    }

    pub fn node_table(&self) -> &GcsTable<NodeId, GcsNodeInfo> {
        &self.node_table
    }

    pub fn job_table(&self) -> &GcsTable<JobId, JobTableData> {
        &self.job_table
    }

    pub fn actor_table(&self) -> &GcsTable<ActorId, ActorTableData> {
        &self.actor_table
    }

    pub fn placement_group_table(
        &self,
    ) -> &GcsTable<PlacementGroupId, PlacementGroupTableData> {
        &self.placement_group_table
    }

    pub fn worker_table(&self) -> &GcsTable<WorkerId, WorkerTableData> {
        &self.worker_table
    }

    pub fn object_table(&self) -> &GcsTable<ObjectId, ObjectTableData> {
        &self.object_table
    }
}

#[cfg(test)]
mod tests {
    use super::kv::MemoryKvStore;
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use gcs_core::error::GcsError;

    fn test_storage() -> GcsTableStorage {
        GcsTableStorage::new(Arc::new(MemoryKvStore::new()), RetryPolicy::new(1, 3))
    }

    #[tokio::test]
    async fn put_then_get_returns_the_record() {
        let storage = test_storage();
        let id = NodeId::from_random();
        let node = GcsNodeInfo {
            node_id: id.binary(),
            ..Default::default()
        };
        storage.node_table().put(&id, &node).await.unwrap();
        assert_eq!(storage.node_table().get(&id).await.unwrap(), Some(node));
    }

    #[tokio::test]
    async fn put_delete_get_returns_none() {
        let storage = test_storage();
        let id = JobId::from_random();
        let job = JobTableData {
            job_id: id.binary(),
            ..Default::default()
        };
        storage.job_table().put(&id, &job).await.unwrap();
        assert!(storage.job_table().delete(&id).await.unwrap());
        assert_eq!(storage.job_table().get(&id).await.unwrap(), None);
        // Deleting again reports the key as absent.
        assert!(!storage.job_table().delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn get_all_returns_every_row() {
        let storage = test_storage();
        let mut expected = HashMap::new();
        for _ in 0..4 {
            let id = ActorId::from_random();
            let actor = ActorTableData {
                actor_id: id.binary(),
                ..Default::default()
            };
            storage.actor_table().put(&id, &actor).await.unwrap();
            expected.insert(id, actor);
        }
        assert_eq!(storage.actor_table().get_all().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_within_budget() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(RetryPolicy::new(1, 5), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GcsError::Transient("flake".to_owned()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(RetryPolicy::new(1, 5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(GcsError::Invalid("bad key".to_owned())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(RetryPolicy::new(1, 3), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(GcsError::Transient("down".to_owned())) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
