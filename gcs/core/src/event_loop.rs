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

//! A single-consumer event loop. All events posted to one loop are processed
//! by a single task in posting order, which is what lets the managers mutate
//! shared metadata without holding locks across suspension points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};
use tokio::sync::mpsc;

use crate::error::{GcsError, Result};

#[tonic::async_trait]
pub trait EventAction<E>: Send + Sync {
    fn on_start(&self);

    fn on_stop(&self);

    async fn on_receive(&self, event: E) -> Result<()>;

    fn on_error(&self, error: GcsError);
}

#[derive(Clone)]
pub struct EventLoop<E> {
    pub name: String,
    pub buffer_size: usize,
    stopped: Arc<AtomicBool>,
    action: Arc<dyn EventAction<E>>,
    tx_event: Option<mpsc::Sender<E>>,
}

impl<E: Send + 'static> EventLoop<E> {
    pub fn new(
        name: impl Into<String>,
        buffer_size: usize,
        action: Arc<dyn EventAction<E>>,
    ) -> Self {
        Self {
            name: name.into(),
            buffer_size,
            stopped: Arc::new(AtomicBool::new(false)),
            action,
            tx_event: None,
        }
    }

    fn run(&self, mut rx_event: mpsc::Receiver<E>) {
        let name = self.name.clone();
        let stopped = self.stopped.clone();
        let action = self.action.clone();
        tokio::spawn(async move {
            info!("Starting the event loop {}", name);
            while !stopped.load(Ordering::SeqCst) {
                if let Some(event) = rx_event.recv().await {
                    if let Err(e) = action.on_receive(event).await {
                        error!("Fail to process event due to {}", e);
                        action.on_error(e);
                    }
                } else {
                    info!("Event channel is closed, exiting the loop {}", name);
                    break;
                }
            }
            info!("The event loop {} has been stopped", name);
        });
    }

    pub fn start(&mut self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(GcsError::Invalid(format!(
                "event loop {} already stopped",
                self.name
            )));
        }
        if self.tx_event.is_some() {
            return Err(GcsError::Invalid(format!(
                "event loop {} already started",
                self.name
            )));
        }

        let (tx_event, rx_event) = mpsc::channel::<E>(self.buffer_size);
        self.tx_event = Some(tx_event);
        self.run(rx_event);
        self.action.on_start();

        Ok(())
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.action.on_stop();
        }
    }

    pub fn get_sender(&self) -> Result<EventSender<E>> {
        self.tx_event
            .as_ref()
            .map(|tx_event| EventSender {
                tx_event: tx_event.clone(),
            })
            .ok_or_else(|| {
                GcsError::Invalid(format!("event loop {} not started", self.name))
            })
    }
}

#[derive(Clone)]
pub struct EventSender<E> {
    tx_event: mpsc::Sender<E>,
}

impl<E: Send + 'static> EventSender<E> {
    pub fn new(tx_event: mpsc::Sender<E>) -> Self {
        Self { tx_event }
    }

    pub async fn post_event(&self, event: E) -> Result<()> {
        self.tx_event
            .send(event)
            .await
            .map_err(|e| GcsError::Transient(format!("fail to post event: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        seen: Arc<Mutex<Vec<u32>>>,
        started: AtomicBool,
    }

    #[tonic::async_trait]
    impl EventAction<u32> for Recorder {
        fn on_start(&self) {
            self.started.store(true, Ordering::SeqCst);
        }

        fn on_stop(&self) {}

        async fn on_receive(&self, event: u32) -> Result<()> {
            self.seen.lock().unwrap().push(event);
            Ok(())
        }

        fn on_error(&self, _error: GcsError) {}
    }

    #[tokio::test]
    async fn events_are_processed_in_post_order() {
        let seen = Arc::new(Mutex::new(vec![]));
        let action = Arc::new(Recorder {
            seen: seen.clone(),
            started: AtomicBool::new(false),
        });
        let mut event_loop = EventLoop::new("test", 16, action.clone());
        event_loop.start().unwrap();
        assert!(action.started.load(Ordering::SeqCst));

        let sender = event_loop.get_sender().unwrap();
        for i in 0..10u32 {
            sender.post_event(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<u32>>());
        event_loop.stop();
    }

    #[tokio::test]
    async fn sender_unavailable_before_start() {
        struct Nop;
        #[tonic::async_trait]
        impl EventAction<u32> for Nop {
            fn on_start(&self) {}
            fn on_stop(&self) {}
            async fn on_receive(&self, _event: u32) -> Result<()> {
                Ok(())
            }
            fn on_error(&self, _error: GcsError) {}
        }
        let event_loop: EventLoop<u32> = EventLoop::new("idle", 4, Arc::new(Nop));
        assert!(event_loop.get_sender().is_err());
    }
}
