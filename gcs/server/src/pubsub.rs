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

//! Metadata change notifications. Channels are keyed by (entity kind,
//! entity id); payloads are immutable and delivered in publication order per
//! channel. Two implementations share the contract: one rides the backing
//! store's native pub/sub, the other keeps the subscriber set in-process and
//! is selected with `grpc_pubsub_enabled`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use gcs_core::error::Result;
use gcs_core::serde::protobuf::PubSubMessage;
use gcs_core::serde::{decode_protobuf, encode_protobuf};

use crate::storage::kv::KvStoreClient;

pub const NODE_CHANNEL: &str = "NODE";
pub const JOB_CHANNEL: &str = "JOB";
pub const ACTOR_CHANNEL: &str = "ACTOR";
pub const PLACEMENT_GROUP_CHANNEL: &str = "PLACEMENT_GROUP";
pub const WORKER_CHANNEL: &str = "WORKER";
pub const OBJECT_CHANNEL: &str = "OBJECT";
pub const RESOURCES_CHANNEL: &str = "RESOURCES";

const DIRECT_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// A live subscription. `next` yields `None` once the publisher has
/// disconnected this subscriber; the subscriber must refetch authoritative
/// state and subscribe again.
pub struct Subscription {
    rx: mpsc::Receiver<PubSubMessage>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<PubSubMessage> {
        self.rx.try_recv().ok()
    }
}

#[tonic::async_trait]
pub trait GcsPublisher: Send + Sync + 'static {
    /// Publish `payload` on `(channel, id)`. Completion means the message is
    /// accepted for delivery, not that every subscriber has seen it.
    async fn publish(&self, channel: &str, id: &[u8], payload: Vec<u8>) -> Result<()>;

    /// Subscribe to one entity (`id` set) or a whole channel (`id` empty).
    fn subscribe(&self, channel: &str, id: Option<&[u8]>) -> Subscription;

    fn debug_string(&self) -> String;
}

fn matches(message: &PubSubMessage, channel: &str, id: &Option<Vec<u8>>) -> bool {
    message.channel == channel
        && match id {
            Some(id) => &message.id == id,
            None => true,
        }
}

// ---------------------------------------------------------------------------
// Store-backed variant
// ---------------------------------------------------------------------------

/// Publishes through the backing store's native pub/sub, so every process
/// connected to the store observes changes without talking to the GCS.
pub struct StoreBackedPublisher {
    store: Arc<dyn KvStoreClient>,
    published: AtomicU64,
}

impl StoreBackedPublisher {
    pub fn new(store: Arc<dyn KvStoreClient>) -> Self {
        Self {
            store,
            published: AtomicU64::new(0),
        }
    }
}

#[tonic::async_trait]
impl GcsPublisher for StoreBackedPublisher {
    async fn publish(&self, channel: &str, id: &[u8], payload: Vec<u8>) -> Result<()> {
        let message = PubSubMessage {
            channel: channel.to_owned(),
            id: id.to_vec(),
            payload,
        };
        self.store
            .publish(channel, encode_protobuf(&message))
            .await?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self, channel: &str, id: Option<&[u8]>) -> Subscription {
        let mut store_rx = self.store.subscribe(channel);
        let (tx, rx) = mpsc::channel(1024);
        let channel = channel.to_owned();
        let id = id.map(|id| id.to_vec());
        tokio::spawn(async move {
            while let Ok(notification) = store_rx.recv().await {
                let message: PubSubMessage =
                    match decode_protobuf(&notification.payload) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Dropping undecodable pubsub payload: {}", e);
                            continue;
                        }
                    };
                if matches(&message, &channel, &id) && tx.send(message).await.is_err() {
                    break;
                }
            }
        });
        Subscription { rx }
    }

    fn debug_string(&self) -> String {
        format!(
            "StoreBackedPublisher {{ published: {} }}",
            self.published.load(Ordering::Relaxed)
        )
    }
}

// ---------------------------------------------------------------------------
// Direct variant
// ---------------------------------------------------------------------------

struct DirectSubscriber {
    channel: String,
    id: Option<Vec<u8>>,
    tx: mpsc::Sender<PubSubMessage>,
    pending: parking_lot::Mutex<VecDeque<PubSubMessage>>,
    blocked_since: parking_lot::Mutex<Option<Instant>>,
}

/// In-process publisher. Each subscriber has a bounded queue; messages are
/// flushed in batches of at most `publish_batch_size`. A subscriber that
/// stays back-pressured past `subscriber_timeout` is disconnected and must
/// re-subscribe after refetching authoritative state.
pub struct DirectPublisher {
    subscribers: Arc<DashMap<u64, Arc<DirectSubscriber>>>,
    next_subscriber_id: AtomicU64,
    batch_size: usize,
    subscriber_timeout: Duration,
    published: AtomicU64,
    flusher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DirectPublisher {
    pub fn new(subscriber_timeout: Duration, batch_size: usize) -> Self {
        let publisher = Self {
            subscribers: Arc::new(DashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
            batch_size: batch_size.max(1),
            subscriber_timeout,
            published: AtomicU64::new(0),
            flusher: parking_lot::Mutex::new(None),
        };
        publisher.start_flusher();
        publisher
    }

    fn start_flusher(&self) {
        let subscribers = self.subscribers.clone();
        let batch_size = self.batch_size;
        let timeout = self.subscriber_timeout;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(DIRECT_FLUSH_INTERVAL);
            loop {
                interval.tick().await;
                let mut evicted = vec![];
                for entry in subscribers.iter() {
                    if !Self::flush_subscriber(entry.value(), batch_size, timeout) {
                        evicted.push(*entry.key());
                    }
                }
                for key in evicted {
                    info!(
                        "Disconnecting back-pressured subscriber {} after {:?}",
                        key, timeout
                    );
                    subscribers.remove(&key);
                }
            }
        });
        *self.flusher.lock() = Some(handle);
    }

    /// Drain up to `batch_size` pending messages into the subscriber's
    /// queue. Returns false when the subscriber has exceeded its timeout and
    /// must be dropped.
    fn flush_subscriber(
        subscriber: &DirectSubscriber,
        batch_size: usize,
        timeout: Duration,
    ) -> bool {
        let mut pending = subscriber.pending.lock();
        for _ in 0..batch_size {
            let Some(message) = pending.pop_front() else {
                break;
            };
            match subscriber.tx.try_send(message) {
                Ok(()) => {
                    *subscriber.blocked_since.lock() = None;
                }
                Err(mpsc::error::TrySendError::Full(message)) => {
                    pending.push_front(message);
                    let mut blocked = subscriber.blocked_since.lock();
                    match *blocked {
                        Some(since) if since.elapsed() > timeout => return false,
                        Some(_) => {}
                        None => *blocked = Some(Instant::now()),
                    }
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = self.flusher.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for DirectPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[tonic::async_trait]
impl GcsPublisher for DirectPublisher {
    async fn publish(&self, channel: &str, id: &[u8], payload: Vec<u8>) -> Result<()> {
        let message = PubSubMessage {
            channel: channel.to_owned(),
            id: id.to_vec(),
            payload,
        };
        let mut evicted = vec![];
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !matches(&message, &subscriber.channel, &subscriber.id) {
                continue;
            }
            subscriber.pending.lock().push_back(message.clone());
            if !Self::flush_subscriber(subscriber, self.batch_size, self.subscriber_timeout)
            {
                evicted.push(*entry.key());
            }
        }
        for key in evicted {
            info!(
                "Disconnecting back-pressured subscriber {} after {:?}",
                key, self.subscriber_timeout
            );
            self.subscribers.remove(&key);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self, channel: &str, id: Option<&[u8]>) -> Subscription {
        let (tx, rx) = mpsc::channel(1024);
        let key = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            key,
            Arc::new(DirectSubscriber {
                channel: channel.to_owned(),
                id: id.map(|id| id.to_vec()),
                tx,
                pending: parking_lot::Mutex::new(VecDeque::new()),
                blocked_since: parking_lot::Mutex::new(None),
            }),
        );
        debug!("Subscriber {} attached to channel {}", key, channel);
        Subscription { rx }
    }

    fn debug_string(&self) -> String {
        format!(
            "DirectPublisher {{ subscribers: {}, published: {} }}",
            self.subscribers.len(),
            self.published.load(Ordering::Relaxed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryKvStore;

    async fn exercise_order(publisher: Arc<dyn GcsPublisher>) {
        let mut sub = publisher.subscribe(ACTOR_CHANNEL, None);
        // Subscription set-up for the store-backed variant races the spawned
        // forwarder; yield so it is listening before the first publish.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..5u8 {
            publisher
                .publish(ACTOR_CHANNEL, &[i], vec![i])
                .await
                .unwrap();
        }
        for i in 0..5u8 {
            let message = tokio::time::timeout(Duration::from_secs(1), sub.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn direct_delivers_in_publish_order() {
        exercise_order(Arc::new(DirectPublisher::new(
            Duration::from_secs(10),
            100,
        )))
        .await;
    }

    #[tokio::test]
    async fn store_backed_delivers_in_publish_order() {
        exercise_order(Arc::new(StoreBackedPublisher::new(Arc::new(
            MemoryKvStore::new(),
        ))))
        .await;
    }

    #[tokio::test]
    async fn id_filter_drops_other_entities() {
        let publisher = DirectPublisher::new(Duration::from_secs(10), 100);
        let mut sub = publisher.subscribe(NODE_CHANNEL, Some(&[1]));
        publisher.publish(NODE_CHANNEL, &[2], vec![2]).await.unwrap();
        publisher.publish(NODE_CHANNEL, &[1], vec![1]).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, vec![1]);
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn back_pressured_subscriber_is_disconnected() {
        let publisher = DirectPublisher::new(Duration::from_millis(50), 4);
        let mut sub = publisher.subscribe(WORKER_CHANNEL, None);
        // Overfill the subscriber queue without draining it.
        for i in 0..2000u32 {
            publisher
                .publish(WORKER_CHANNEL, b"w", i.to_le_bytes().to_vec())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        publisher
            .publish(WORKER_CHANNEL, b"w", vec![0])
            .await
            .unwrap();
        assert_eq!(publisher.subscribers.len(), 0);
        // The subscriber drains what was queued, then sees the disconnect.
        while sub.try_next().is_some() {}
        assert!(sub.next().await.is_none());
    }
}
