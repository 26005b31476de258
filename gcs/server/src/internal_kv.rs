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

//! The reserved key family exposed to drivers and runtime tooling, plus the
//! `gcs://` URI cleanup hook used when runtime environments are released.

use std::sync::Arc;

use log::error;

use gcs_core::error::{GcsError, Result};

use crate::storage::kv::KvStoreClient;
use crate::storage::INTERNAL_KV_TABLE;

pub struct InternalKvManager {
    store: Arc<dyn KvStoreClient>,
}

impl InternalKvManager {
    pub fn new(store: Arc<dyn KvStoreClient>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(INTERNAL_KV_TABLE, key.as_bytes()).await
    }

    /// Returns whether a new key was added. With `overwrite` unset an
    /// existing key is left untouched.
    pub async fn put(&self, key: &str, value: Vec<u8>, overwrite: bool) -> Result<bool> {
        let exists = self.store.exists(INTERNAL_KV_TABLE, key.as_bytes()).await?;
        if exists && !overwrite {
            return Ok(false);
        }
        self.store
            .put(INTERNAL_KV_TABLE, key.as_bytes(), value)
            .await?;
        Ok(!exists)
    }

    /// Returns whether the key existed.
    pub async fn del(&self, key: &str) -> Result<bool> {
        self.store.delete(INTERNAL_KV_TABLE, key.as_bytes()).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.store.exists(INTERNAL_KV_TABLE, key.as_bytes()).await
    }

    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self
            .store
            .keys(INTERNAL_KV_TABLE, prefix.as_bytes())
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| String::from_utf8(key).ok())
            .collect())
    }

    /// Delete the key behind a `gcs://` URI. URIs with other schemes belong
    /// to other storage and succeed without touching anything; a URI with no
    /// scheme or an empty remainder is invalid. Returns whether a key was
    /// actually deleted.
    pub async fn delete_uri(&self, uri: &str) -> Result<bool> {
        let separator = "://";
        let Some(position) = uri.find(separator) else {
            error!("Invalid uri: {}", uri);
            return Err(GcsError::Invalid(format!("invalid uri: {uri}")));
        };
        let key = &uri[position + separator.len()..];
        if key.is_empty() {
            error!("Invalid uri: {}", uri);
            return Err(GcsError::Invalid(format!("invalid uri: {uri}")));
        }
        let scheme = &uri[..position];
        if scheme != "gcs" {
            return Ok(true);
        }
        self.del(uri).await
    }
}
