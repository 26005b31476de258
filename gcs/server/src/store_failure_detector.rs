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

//! Liveness probing of the backing store. Losing the store is fatal: the
//! server stops and its supervisor restarts it, replaying from the store
//! once it is back.

use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::storage::kv::KvStoreClient;

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub type StoreFailureCallback = Arc<dyn Fn() + Send + Sync>;

pub struct StoreFailureDetector {
    store: Arc<dyn KvStoreClient>,
    on_failure: StoreFailureCallback,
    prober: Mutex<Option<JoinHandle<()>>>,
}

impl StoreFailureDetector {
    pub fn new(store: Arc<dyn KvStoreClient>, on_failure: StoreFailureCallback) -> Self {
        Self {
            store,
            on_failure,
            prober: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut prober = self.prober.lock();
        if prober.is_some() {
            return;
        }
        let store = self.store.clone();
        let on_failure = self.on_failure.clone();
        *prober = Some(tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            let mut interval = tokio::time::interval(PROBE_INTERVAL);
            loop {
                interval.tick().await;
                match store.ping().await {
                    Ok(()) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            "Backing store probe failed ({}/{}): {}",
                            consecutive_failures, MAX_CONSECUTIVE_FAILURES, e
                        );
                        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            error!(
                                "Backing store is unreachable, stopping the server"
                            );
                            on_failure();
                            return;
                        }
                    }
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.prober.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for StoreFailureDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::storage::kv::{FailingKvStore, MemoryKvStore};

    #[tokio::test(start_paused = true)]
    async fn sustained_loss_triggers_the_callback() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let detector = StoreFailureDetector::new(
            Arc::new(FailingKvStore),
            Arc::new(move || flag.store(true, Ordering::SeqCst)),
        );
        detector.start();
        tokio::time::sleep(PROBE_INTERVAL * (MAX_CONSECUTIVE_FAILURES + 1)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_store_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let detector = StoreFailureDetector::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(move || flag.store(true, Ordering::SeqCst)),
        );
        detector.start();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
        detector.stop();
    }
}
