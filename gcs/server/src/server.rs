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

//! The server shell. Boot order follows the recovery contract: load every
//! table, initialize managers from the snapshot, wire the event cascades,
//! then serve; only once serving does the failure detector start. Stop runs
//! in reverse, heartbeats first, and never deletes the advertised address
//! key so drivers can find the restarted server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use gcs_core::error::{GcsError, Result};
use gcs_core::event_loop::{EventAction, EventLoop, EventSender};
use gcs_core::ids::{BaseId, NodeId};
use gcs_core::serde::protobuf::GcsNodeInfo;

use crate::actor_manager::ActorManager;
use crate::actor_scheduler::{ActorScheduler, NodeAddressResolver};
use crate::config::GcsServerConfig;
use crate::event::GcsEvent;
use crate::heartbeat_manager::HeartbeatManager;
use crate::init_data::GcsInitData;
use crate::internal_kv::InternalKvManager;
use crate::job_manager::JobManager;
use crate::node_manager::NodeManager;
use crate::object_manager::ObjectManager;
use crate::placement_group_manager::PlacementGroupManager;
use crate::placement_group_scheduler::PlacementGroupScheduler;
use crate::pubsub::{DirectPublisher, GcsPublisher, StoreBackedPublisher};
use crate::raylet_client::{RayletClientFactory, RayletClientPool};
use crate::resource_broadcaster::ResourceBroadcaster;
use crate::resource_manager::ResourceManager;
use crate::resource_report_poller::ResourceReportPoller;
use crate::storage::kv::KvStoreClient;
use crate::storage::{GcsTableStorage, RetryPolicy, GCS_SERVER_ADDRESS_KEY};
use crate::store_failure_detector::StoreFailureDetector;
use crate::worker_manager::WorkerManager;

/// Pieces the event processor can only receive after the event loop is
/// running (they need the loop's sender themselves).
struct ProcessorWiring {
    heartbeat_manager: Arc<HeartbeatManager>,
    actor_scheduler: Arc<ActorScheduler>,
    placement_group_scheduler: Arc<PlacementGroupScheduler>,
    resource_report_poller: Arc<ResourceReportPoller>,
    resource_broadcaster: Option<Arc<ResourceBroadcaster>>,
}

/// The main loop's action: every cross-manager cascade in its fixed order.
/// Managers return facts; this turns them into effects.
struct GcsEventProcessor {
    node_manager: Arc<NodeManager>,
    resource_manager: Arc<ResourceManager>,
    actor_manager: Arc<ActorManager>,
    placement_group_manager: Arc<PlacementGroupManager>,
    object_manager: Arc<ObjectManager>,
    client_pool: RayletClientPool,
    wiring: OnceLock<ProcessorWiring>,
    event_counts: DashMap<&'static str, u64>,
}

impl GcsEventProcessor {
    fn wiring(&self) -> Result<&ProcessorWiring> {
        self.wiring
            .get()
            .ok_or_else(|| GcsError::Fatal("event wiring not installed".to_owned()))
    }

    /// Kick the next scheduling round: at most one placement group attempt
    /// plus every actor waiting in PENDING_CREATION.
    async fn schedule_pending(&self) -> Result<()> {
        let wiring = self.wiring()?;
        if let Some(placement_group) =
            self.placement_group_manager.next_pending_placement_group()
        {
            wiring
                .placement_group_scheduler
                .schedule(&placement_group)
                .await?;
        }
        for actor in self.actor_manager.schedule_pending_actors() {
            wiring.actor_scheduler.schedule(&actor).await?;
        }
        Ok(())
    }

    async fn handle_node_added(&self, node: Arc<GcsNodeInfo>) -> Result<()> {
        let wiring = self.wiring()?;
        let node_id = NodeId::from_binary(&node.node_id)?;
        self.resource_manager.on_node_add(node_id, &node);
        self.schedule_pending().await?;
        wiring.heartbeat_manager.add_node(node_id);
        wiring.resource_report_poller.handle_node_added(&node);
        if let Some(broadcaster) = &wiring.resource_broadcaster {
            broadcaster.handle_node_added(&node);
        }
        Ok(())
    }

    /// The node-removed cascade, in its fixed order: resources, placement
    /// groups, actors, then the client pool, then the report plumbing.
    async fn handle_node_removed(&self, node: Arc<GcsNodeInfo>) -> Result<()> {
        let wiring = self.wiring()?;
        let node_id = NodeId::from_binary(&node.node_id)?;
        self.resource_manager.on_node_dead(&node_id);
        self.placement_group_manager.on_node_dead(&node_id).await?;
        let cascade = self.actor_manager.on_node_dead(&node_id).await?;
        self.client_pool.disconnect(&node_id);
        wiring.heartbeat_manager.remove_node(&node_id);
        wiring.resource_report_poller.handle_node_removed(&node_id);
        if let Some(broadcaster) = &wiring.resource_broadcaster {
            broadcaster.handle_node_removed(&node_id);
        }
        self.object_manager.on_node_dead(&node_id).await?;

        for actor_id in &cascade.destroyed {
            self.clean_placement_groups_for_actor(actor_id).await?;
        }
        // Rescheduling placement groups and restartable actors go straight
        // back into the pipeline against the surviving nodes.
        self.schedule_pending().await
    }

    async fn clean_placement_groups_for_actor(
        &self,
        actor_id: &gcs_core::ids::ActorId,
    ) -> Result<()> {
        let removed = self
            .placement_group_manager
            .clean_on_actor_dead(actor_id)
            .await?;
        let wiring = self.wiring()?;
        for placement_group in &removed {
            wiring
                .placement_group_scheduler
                .cancel_committed_bundles(placement_group);
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl EventAction<GcsEvent> for GcsEventProcessor {
    fn on_start(&self) {
        info!("GCS event processor started");
    }

    fn on_stop(&self) {
        info!("GCS event processor stopped");
    }

    async fn on_receive(&self, event: GcsEvent) -> Result<()> {
        *self.event_counts.entry(event.label()).or_insert(0) += 1;
        match event {
            GcsEvent::NodeAdded(node) => self.handle_node_added(node).await,
            GcsEvent::NodeFailure(node_id) => {
                match self.node_manager.on_node_failure(node_id).await? {
                    Some(dead) => self.handle_node_removed(dead).await,
                    None => Ok(()),
                }
            }
            GcsEvent::NodeRemoved(node) => self.handle_node_removed(node).await,
            GcsEvent::ResourceReport(report) => {
                self.resource_manager.update_from_resource_report(*report);
                Ok(())
            }
            GcsEvent::WorkerDead {
                worker_id,
                node_id,
                exit_type,
                creation_task_exception,
            } => {
                let death = crate::worker_manager::WorkerDeath {
                    worker_id,
                    node_id,
                    exit_type,
                    creation_task_exception,
                };
                let cascade = self.actor_manager.on_worker_dead(&death).await?;
                for actor_id in &cascade.destroyed {
                    self.clean_placement_groups_for_actor(actor_id).await?;
                }
                let wiring = self.wiring()?;
                for actor in cascade.to_schedule {
                    wiring.actor_scheduler.schedule(&actor).await?;
                }
                Ok(())
            }
            GcsEvent::JobFinished(job_id) => {
                let destroyed = self.actor_manager.on_job_finished(&job_id).await?;
                for actor_id in &destroyed {
                    self.clean_placement_groups_for_actor(actor_id).await?;
                }
                let removed = self
                    .placement_group_manager
                    .clean_on_job_dead(&job_id)
                    .await?;
                let wiring = self.wiring()?;
                for placement_group in &removed {
                    wiring
                        .placement_group_scheduler
                        .cancel_committed_bundles(placement_group);
                }
                Ok(())
            }
            GcsEvent::ActorCreationSucceeded {
                actor_id,
                node_id,
                worker_id,
            } => {
                self.actor_manager
                    .on_actor_creation_success(actor_id, node_id, worker_id)
                    .await
            }
            GcsEvent::ActorCreationFailed {
                actor_id,
                creation_task_exception,
            } => {
                let cascade = self
                    .actor_manager
                    .on_actor_creation_failed(actor_id, creation_task_exception)
                    .await?;
                for actor_id in &cascade.destroyed {
                    self.clean_placement_groups_for_actor(actor_id).await?;
                }
                Ok(())
            }
            GcsEvent::ActorDestroyed(actor_id) => {
                self.clean_placement_groups_for_actor(&actor_id).await
            }
            GcsEvent::PlacementGroupSchedulingSucceeded {
                placement_group_id,
                placements,
            } => {
                let applied = self
                    .placement_group_manager
                    .on_scheduling_success(placement_group_id, &placements)
                    .await?;
                if !applied {
                    // Removed while the attempt was in flight: give back the
                    // capacity and the raylet-side reservations.
                    self.placement_group_manager
                        .release_bundle_resources(placement_group_id, &placements);
                    let wiring = self.wiring()?;
                    wiring.placement_group_scheduler.cancel_placements(
                        placement_group_id,
                        &placements,
                    );
                }
                self.schedule_pending().await
            }
            GcsEvent::PlacementGroupSchedulingFailed {
                placement_group_id,
                placements: _,
            } => {
                self.placement_group_manager
                    .on_scheduling_failed(placement_group_id);
                Ok(())
            }
        }
    }

    fn on_error(&self, error: GcsError) {
        error!("Event processing failed: {}", error);
    }
}

pub struct GcsServer {
    config: GcsServerConfig,
    storage: Arc<GcsTableStorage>,
    publisher: Arc<dyn GcsPublisher>,
    internal_kv: Arc<InternalKvManager>,
    node_manager: Arc<NodeManager>,
    heartbeat_manager: Arc<HeartbeatManager>,
    resource_manager: Arc<ResourceManager>,
    job_manager: Arc<JobManager>,
    actor_manager: Arc<ActorManager>,
    actor_scheduler: Arc<ActorScheduler>,
    placement_group_manager: Arc<PlacementGroupManager>,
    placement_group_scheduler: Arc<PlacementGroupScheduler>,
    worker_manager: Arc<WorkerManager>,
    object_manager: Arc<ObjectManager>,
    resource_report_poller: Arc<ResourceReportPoller>,
    resource_broadcaster: Option<Arc<ResourceBroadcaster>>,
    store_failure_detector: Arc<StoreFailureDetector>,
    client_pool: RayletClientPool,
    event_loop: EventLoop<GcsEvent>,
    event_sender: EventSender<GcsEvent>,
    processor: Arc<GcsEventProcessor>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    fatal_tx: watch::Sender<bool>,
    is_stopped: AtomicBool,
}

impl GcsServer {
    /// Boot the server: connect to the store, replay every table, start the
    /// managers and the main loop, advertise the address, and only then arm
    /// the failure detectors.
    pub async fn start(
        config: GcsServerConfig,
        store: Arc<dyn KvStoreClient>,
        client_factory: Arc<dyn RayletClientFactory>,
    ) -> Result<Self> {
        // A store that cannot answer at boot is fatal: there is nothing to
        // recover from.
        store.ping().await.map_err(|e| {
            GcsError::Fatal(format!("failed to reach the backing store: {e}"))
        })?;

        let retry =
            RetryPolicy::new(config.kv_retry_base_delay_ms, config.kv_retry_max_attempts);
        let storage = Arc::new(GcsTableStorage::new(store.clone(), retry));
        let publisher: Arc<dyn GcsPublisher> = if config.grpc_pubsub_enabled {
            Arc::new(DirectPublisher::new(
                Duration::from_millis(config.subscriber_timeout_ms),
                config.publish_batch_size,
            ))
        } else {
            Arc::new(StoreBackedPublisher::new(store.clone()))
        };

        info!("Loading GCS tables");
        let init_data = GcsInitData::load(&storage).await?;
        info!(
            "Loaded {} nodes, {} jobs, {} actors, {} placement groups",
            init_data.nodes.len(),
            init_data.jobs.len(),
            init_data.actors.len(),
            init_data.placement_groups.len()
        );

        let client_pool = RayletClientPool::new(client_factory);
        let internal_kv = Arc::new(InternalKvManager::new(store.clone()));

        let resource_manager = Arc::new(ResourceManager::new());
        resource_manager.initialize(&init_data);
        let node_manager =
            Arc::new(NodeManager::new(storage.clone(), publisher.clone()));
        node_manager.initialize(&init_data);
        let job_manager = Arc::new(JobManager::new(storage.clone(), publisher.clone()));
        job_manager.initialize(&init_data);
        let worker_manager =
            Arc::new(WorkerManager::new(storage.clone(), publisher.clone()));
        worker_manager.initialize(&init_data);
        let object_manager =
            Arc::new(ObjectManager::new(storage.clone(), publisher.clone()));
        object_manager.initialize(&init_data);

        let namespace_job_manager = job_manager.clone();
        let actor_manager = Arc::new(ActorManager::new(
            storage.clone(),
            publisher.clone(),
            Arc::new(move |job_id| namespace_job_manager.get_ray_namespace(job_id)),
            config.actor_gc_delay_ms,
        ));
        actor_manager.initialize(&init_data);
        let placement_group_manager = Arc::new(PlacementGroupManager::new(
            storage.clone(),
            publisher.clone(),
            resource_manager.clone(),
            config.remove_detached_placement_groups_on_job_finish,
        ));
        placement_group_manager.initialize(&init_data);

        let processor = Arc::new(GcsEventProcessor {
            node_manager: node_manager.clone(),
            resource_manager: resource_manager.clone(),
            actor_manager: actor_manager.clone(),
            placement_group_manager: placement_group_manager.clone(),
            object_manager: object_manager.clone(),
            client_pool: client_pool.clone(),
            wiring: OnceLock::new(),
            event_counts: DashMap::new(),
        });
        let mut event_loop = EventLoop::new(
            "gcs_main",
            config.event_loop_buffer_size,
            processor.clone(),
        );
        event_loop.start()?;
        let event_sender = event_loop.get_sender()?;

        // Sender-dependent components, wired before any event can arrive.
        let death_sender = event_sender.clone();
        let heartbeat_manager = Arc::new(HeartbeatManager::new(
            config.heartbeat_interval_ms,
            config.heartbeat_timeout_ms(),
            Arc::new(move |node_id| {
                let sender = death_sender.clone();
                tokio::spawn(async move {
                    if let Err(e) = sender.post_event(GcsEvent::NodeFailure(node_id)).await
                    {
                        error!("Failed to post node death for {}: {}", node_id, e);
                    }
                });
            }),
        ));
        heartbeat_manager.initialize(&init_data);

        let resolver_node_manager = node_manager.clone();
        let resolve_address: NodeAddressResolver = Arc::new(move |node_id| {
            resolver_node_manager
                .get_alive_node(node_id)
                .and_then(|node| node.address.clone())
        });
        let actor_scheduler = Arc::new(ActorScheduler::new(
            resource_manager.clone(),
            client_pool.clone(),
            resolve_address.clone(),
            event_sender.clone(),
            config.actor_creation_timeout_ms,
        ));
        let placement_group_scheduler = Arc::new(PlacementGroupScheduler::new(
            resource_manager.clone(),
            client_pool.clone(),
            resolve_address,
            event_sender.clone(),
            config.raylet_poll_timeout_ms,
        ));

        let report_sender = event_sender.clone();
        let resource_report_poller = Arc::new(ResourceReportPoller::new(
            client_pool.clone(),
            config.raylet_report_resources_period_ms,
            config.raylet_poll_timeout_ms,
            Arc::new(move |report| {
                let sender = report_sender.clone();
                tokio::spawn(async move {
                    if let Err(e) = sender
                        .post_event(GcsEvent::ResourceReport(Box::new(report)))
                        .await
                    {
                        error!("Failed to post resource report: {}", e);
                    }
                });
            }),
        ));
        resource_report_poller.initialize(&init_data);

        let resource_broadcaster = if config.grpc_based_resource_broadcast {
            let broadcast_resource_manager = resource_manager.clone();
            let broadcaster = Arc::new(ResourceBroadcaster::new(
                client_pool.clone(),
                config.resource_broadcast_period_ms,
                Arc::new(move |buffer| {
                    broadcast_resource_manager
                        .get_resource_usage_batch_for_broadcast(buffer)
                }),
            ));
            broadcaster.initialize(&init_data);
            Some(broadcaster)
        } else {
            None
        };

        processor
            .wiring
            .set(ProcessorWiring {
                heartbeat_manager: heartbeat_manager.clone(),
                actor_scheduler: actor_scheduler.clone(),
                placement_group_scheduler: placement_group_scheduler.clone(),
                resource_report_poller: resource_report_poller.clone(),
                resource_broadcaster: resource_broadcaster.clone(),
            })
            .map_err(|_| GcsError::Fatal("event wiring installed twice".to_owned()))?;

        let (fatal_tx, _) = watch::channel(false);
        let failure_fatal_tx = fatal_tx.clone();
        let store_failure_detector = Arc::new(StoreFailureDetector::new(
            store.clone(),
            Arc::new(move || {
                let _ = failure_fatal_tx.send(true);
            }),
        ));

        let server = Self {
            config,
            storage,
            publisher,
            internal_kv,
            node_manager,
            heartbeat_manager,
            resource_manager,
            job_manager,
            actor_manager,
            actor_scheduler,
            placement_group_manager,
            placement_group_scheduler,
            worker_manager,
            object_manager,
            resource_report_poller,
            resource_broadcaster,
            store_failure_detector,
            client_pool,
            event_loop,
            event_sender,
            processor,
            background_tasks: Mutex::new(Vec::new()),
            fatal_tx,
            is_stopped: AtomicBool::new(false),
        };

        // Serving from here on. Advertise the address, then arm the failure
        // detector; nodes could not have refreshed their deadlines earlier.
        server.store_server_address().await?;
        server.heartbeat_manager.start();
        if let Some(broadcaster) = &server.resource_broadcaster {
            broadcaster.start();
        }
        server.store_failure_detector.start();
        server.actor_manager.clone().start_gc();
        server.spawn_debug_dump();
        server.spawn_event_stats_print();

        // Resume whatever the snapshot left half-done.
        server.processor.schedule_pending().await?;

        info!("GCS server started");
        Ok(server)
    }

    async fn store_server_address(&self) -> Result<()> {
        let address = format!(
            "{}:{}",
            self.config.node_ip_address, self.config.grpc_server_port
        );
        self.storage
            .store()
            .put(
                crate::storage::INTERNAL_KV_TABLE,
                GCS_SERVER_ADDRESS_KEY,
                address.clone().into_bytes(),
            )
            .await?;
        info!("GCS server address stored: {}", address);
        Ok(())
    }

    fn spawn_debug_dump(&self) {
        let interval_minutes = self.config.gcs_dump_debug_log_interval_minutes;
        if interval_minutes == 0 {
            return;
        }
        let node_manager = self.node_manager.clone();
        let resource_manager = self.resource_manager.clone();
        let job_manager = self.job_manager.clone();
        let actor_manager = self.actor_manager.clone();
        let placement_group_manager = self.placement_group_manager.clone();
        let worker_manager = self.worker_manager.clone();
        let object_manager = self.object_manager.clone();
        let publisher = self.publisher.clone();
        let broadcaster = self.resource_broadcaster.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(interval_minutes * 60));
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut dump = format!(
                    "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
                    node_manager.debug_string(),
                    resource_manager.debug_string(),
                    job_manager.debug_string(),
                    actor_manager.debug_string(),
                    placement_group_manager.debug_string(),
                    worker_manager.debug_string(),
                    object_manager.debug_string(),
                    publisher.debug_string(),
                );
                if let Some(broadcaster) = &broadcaster {
                    dump.push('\n');
                    dump.push_str(&broadcaster.debug_string());
                }
                info!("GCS debug state:\n{}", dump);
            }
        });
        self.background_tasks.lock().push(handle);
    }

    fn spawn_event_stats_print(&self) {
        let interval_ms = self.config.event_stats_print_interval_ms;
        if interval_ms == 0 {
            return;
        }
        let processor = self.processor.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(interval_ms));
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut counts: Vec<(&'static str, u64)> = processor
                    .event_counts
                    .iter()
                    .map(|entry| (*entry.key(), *entry.value()))
                    .collect();
                counts.sort();
                let lines: Vec<String> = counts
                    .iter()
                    .map(|(label, count)| format!("  {label}: {count}"))
                    .collect();
                info!("Event stats:\n{}", lines.join("\n"));
            }
        });
        self.background_tasks.lock().push(handle);
    }

    /// Stop everything, heartbeats first so a slow shutdown cannot declare
    /// live nodes dead. The advertised address key stays: the store is the
    /// source of truth and the restarted server will claim it again.
    pub fn stop(&self) {
        if self.is_stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping GCS server");
        self.heartbeat_manager.stop();
        self.resource_report_poller.stop();
        if let Some(broadcaster) = &self.resource_broadcaster {
            broadcaster.stop();
        }
        self.store_failure_detector.stop();
        self.actor_manager.stop_gc();
        for handle in self.background_tasks.lock().drain(..) {
            handle.abort();
        }
        self.event_loop.stop();
        info!("GCS server stopped");
    }

    /// Resolves to true if the backing store is declared lost; the embedder
    /// should stop the server and exit so a supervisor can restart it.
    pub fn fatal_error_signal(&self) -> watch::Receiver<bool> {
        self.fatal_tx.subscribe()
    }

    // -- accessors used by the RPC handlers and tests ---------------------

    pub fn config(&self) -> &GcsServerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<GcsTableStorage> {
        &self.storage
    }

    pub fn publisher(&self) -> &Arc<dyn GcsPublisher> {
        &self.publisher
    }

    pub fn internal_kv(&self) -> &Arc<InternalKvManager> {
        &self.internal_kv
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    pub fn heartbeat_manager(&self) -> &Arc<HeartbeatManager> {
        &self.heartbeat_manager
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.resource_manager
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.job_manager
    }

    pub fn actor_manager(&self) -> &Arc<ActorManager> {
        &self.actor_manager
    }

    pub fn actor_scheduler(&self) -> &Arc<ActorScheduler> {
        &self.actor_scheduler
    }

    pub fn placement_group_manager(&self) -> &Arc<PlacementGroupManager> {
        &self.placement_group_manager
    }

    pub fn placement_group_scheduler(&self) -> &Arc<PlacementGroupScheduler> {
        &self.placement_group_scheduler
    }

    pub fn worker_manager(&self) -> &Arc<WorkerManager> {
        &self.worker_manager
    }

    pub fn object_manager(&self) -> &Arc<ObjectManager> {
        &self.object_manager
    }

    pub fn client_pool(&self) -> &RayletClientPool {
        &self.client_pool
    }

    pub(crate) fn event_sender(&self) -> EventSender<GcsEvent> {
        self.event_sender.clone()
    }
}

impl Drop for GcsServer {
    fn drop(&mut self) {
        if !self.is_stopped.load(Ordering::SeqCst) {
            warn!("GCS server dropped without an explicit stop");
            self.stop();
        }
    }
}
