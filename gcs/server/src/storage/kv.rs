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

//! The durable backing store, treated as a black box behind a trait. The
//! production deployment points this at a Redis-compatible service; tests
//! and single-node deployments use [`MemoryKvStore`].

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use gcs_core::error::{GcsError, Result};

/// A native-pub/sub message from the store, used by the store-backed
/// publisher variant.
#[derive(Clone, Debug)]
pub struct KvNotification {
    pub channel: String,
    pub payload: Vec<u8>,
}

#[tonic::async_trait]
pub trait KvStoreClient: Send + Sync + 'static {
    async fn put(&self, table: &str, key: &[u8], value: Vec<u8>) -> Result<()>;

    async fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns whether the key existed.
    async fn delete(&self, table: &str, key: &[u8]) -> Result<bool>;

    async fn batch_delete(&self, table: &str, keys: &[Vec<u8>]) -> Result<()>;

    async fn get_all(&self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    async fn exists(&self, table: &str, key: &[u8]) -> Result<bool>;

    async fn keys(&self, table: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Liveness probe for the failure detector.
    async fn ping(&self) -> Result<()>;

    /// Publish on the store's native pub/sub channel.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to the store's native pub/sub channel.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<KvNotification>;
}

/// In-memory store. Tables are plain sorted maps; the native pub/sub is a
/// broadcast channel per channel name.
pub struct MemoryKvStore {
    tables: Mutex<BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
    channels: DashMap<String, broadcast::Sender<KvNotification>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(BTreeMap::new()),
            channels: DashMap::new(),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<KvNotification> {
        self.channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl KvStoreClient for MemoryKvStore {
    async fn put(&self, table: &str, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.tables
            .lock()
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_vec(), value);
        Ok(())
    }

    async fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .and_then(|t| t.get(key).cloned()))
    }

    async fn delete(&self, table: &str, key: &[u8]) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .get_mut(table)
            .map(|t| t.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn batch_delete(&self, table: &str, keys: &[Vec<u8>]) -> Result<()> {
        let mut tables = self.tables.lock();
        if let Some(t) = tables.get_mut(table) {
            for key in keys {
                t.remove(key);
            }
        }
        Ok(())
    }

    async fn get_all(&self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn exists(&self, table: &str, key: &[u8]) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|t| t.contains_key(key))
            .unwrap_or(false))
    }

    async fn keys(&self, table: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|t| {
                t.keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        // A send error only means there is no subscriber right now.
        let _ = self.sender(channel).send(KvNotification {
            channel: channel.to_owned(),
            payload,
        });
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<KvNotification> {
        self.sender(channel).subscribe()
    }
}

/// A store wrapper that fails every operation. Used in tests to exercise the
/// retry and failure-detector paths.
pub struct FailingKvStore;

#[tonic::async_trait]
impl KvStoreClient for FailingKvStore {
    async fn put(&self, _table: &str, _key: &[u8], _value: Vec<u8>) -> Result<()> {
        Err(GcsError::Transient("store unavailable".to_owned()))
    }

    async fn get(&self, _table: &str, _key: &[u8]) -> Result<Option<Vec<u8>>> {
        Err(GcsError::Transient("store unavailable".to_owned()))
    }

    async fn delete(&self, _table: &str, _key: &[u8]) -> Result<bool> {
        Err(GcsError::Transient("store unavailable".to_owned()))
    }

    async fn batch_delete(&self, _table: &str, _keys: &[Vec<u8>]) -> Result<()> {
        Err(GcsError::Transient("store unavailable".to_owned()))
    }

    async fn get_all(&self, _table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Err(GcsError::Transient("store unavailable".to_owned()))
    }

    async fn exists(&self, _table: &str, _key: &[u8]) -> Result<bool> {
        Err(GcsError::Transient("store unavailable".to_owned()))
    }

    async fn keys(&self, _table: &str, _prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        Err(GcsError::Transient("store unavailable".to_owned()))
    }

    async fn ping(&self) -> Result<()> {
        Err(GcsError::Transient("store unavailable".to_owned()))
    }

    async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> Result<()> {
        Err(GcsError::Transient("store unavailable".to_owned()))
    }

    fn subscribe(&self, _channel: &str) -> broadcast::Receiver<KvNotification> {
        broadcast::channel(1).1
    }
}
