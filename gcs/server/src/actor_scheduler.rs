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

//! Places one actor at a time: pick a node from the resource view, deduct
//! its demand, and issue the creation RPC to that raylet. Success and
//! failure both come back to the main loop as events; the manager owns the
//! state machine, this owns only the attempt.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};

use gcs_core::error::Result;
use gcs_core::event_loop::EventSender;
use gcs_core::ids::{ActorId, BaseId, NodeId, WorkerId};
use gcs_core::serde::protobuf::{
    ActorTableData, CreateActorOnRayletParams, NodeAddress,
};

use crate::event::GcsEvent;
use crate::raylet_client::RayletClientPool;
use crate::resource_manager::ResourceManager;
use crate::resource_scheduler::{self, SchedulingResult};

/// Resolves a node id to its RPC address; wired to the node manager by the
/// server so the scheduler needs no manager handle.
pub type NodeAddressResolver =
    Arc<dyn Fn(&NodeId) -> Option<NodeAddress> + Send + Sync>;

pub struct ActorScheduler {
    resource_manager: Arc<ResourceManager>,
    client_pool: RayletClientPool,
    resolve_address: NodeAddressResolver,
    event_sender: EventSender<GcsEvent>,
    creation_timeout: Duration,
    /// Actors with an outstanding creation RPC. At most one attempt may be
    /// in flight per actor.
    inflight: Arc<DashMap<ActorId, NodeId>>,
}

impl ActorScheduler {
    pub fn new(
        resource_manager: Arc<ResourceManager>,
        client_pool: RayletClientPool,
        resolve_address: NodeAddressResolver,
        event_sender: EventSender<GcsEvent>,
        creation_timeout_ms: u64,
    ) -> Self {
        Self {
            resource_manager,
            client_pool,
            resolve_address,
            event_sender,
            creation_timeout: Duration::from_millis(creation_timeout_ms),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Attempt to place the actor. Non-blocking: selection happens inline,
    /// the creation RPC runs as a follow-up task posting its outcome back
    /// onto the main loop.
    pub async fn schedule(&self, actor: &ActorTableData) -> Result<()> {
        let actor_id = ActorId::from_binary(&actor.actor_id)?;
        if self.inflight.contains_key(&actor_id) {
            debug!(
                "Actor {} already has a creation attempt in flight, skipping",
                actor_id
            );
            return Ok(());
        }

        let view = self.resource_manager.cluster_view();
        let node_id =
            match resource_scheduler::schedule_one(&view, &actor.required_resources) {
                SchedulingResult::Success(nodes) => nodes[0],
                SchedulingResult::Infeasible => {
                    debug!("No feasible node for actor {}, leaving it pending", actor_id);
                    return self.post_failure(actor_id, None).await;
                }
            };
        if !self
            .resource_manager
            .acquire_resources(&node_id, &actor.required_resources)
        {
            // The view moved between selection and acquisition.
            return self.post_failure(actor_id, None).await;
        }
        let Some(address) = (self.resolve_address)(&node_id) else {
            self.resource_manager
                .release_resources(&node_id, &actor.required_resources);
            return self.post_failure(actor_id, None).await;
        };

        self.inflight.insert(actor_id, node_id);
        let client = self.client_pool.get_or_connect(&node_id, &address);
        let mut placed = actor.clone();
        placed.node_id = node_id.binary();

        let resource_manager = self.resource_manager.clone();
        let event_sender = self.event_sender.clone();
        let inflight = self.inflight.clone();
        let creation_timeout = self.creation_timeout;
        let demand = actor.required_resources.clone();
        tokio::spawn(async move {
            let request = CreateActorOnRayletParams {
                actor: Some(placed),
            };
            let outcome =
                tokio::time::timeout(creation_timeout, client.create_actor(request))
                    .await;
            inflight.remove(&actor_id);
            let event = match outcome {
                Ok(Ok(result)) if result.creation_task_exception.is_none() => {
                    match WorkerId::from_binary(&result.worker_id) {
                        Ok(worker_id) => GcsEvent::ActorCreationSucceeded {
                            actor_id,
                            node_id,
                            worker_id,
                        },
                        Err(_) => {
                            warn!(
                                "Raylet {} returned no worker for actor {}",
                                node_id, actor_id
                            );
                            resource_manager.release_resources(&node_id, &demand);
                            GcsEvent::ActorCreationFailed {
                                actor_id,
                                creation_task_exception: None,
                            }
                        }
                    }
                }
                Ok(Ok(result)) => {
                    resource_manager.release_resources(&node_id, &demand);
                    GcsEvent::ActorCreationFailed {
                        actor_id,
                        creation_task_exception: result.creation_task_exception,
                    }
                }
                Ok(Err(e)) => {
                    warn!("Creation RPC for actor {} failed: {}", actor_id, e);
                    resource_manager.release_resources(&node_id, &demand);
                    GcsEvent::ActorCreationFailed {
                        actor_id,
                        creation_task_exception: None,
                    }
                }
                Err(_) => {
                    warn!(
                        "Creation RPC for actor {} timed out after {:?}",
                        actor_id, creation_timeout
                    );
                    resource_manager.release_resources(&node_id, &demand);
                    GcsEvent::ActorCreationFailed {
                        actor_id,
                        creation_task_exception: None,
                    }
                }
            };
            if let Err(e) = event_sender.post_event(event).await {
                warn!("Failed to post actor creation outcome: {}", e);
            }
        });
        Ok(())
    }

    async fn post_failure(
        &self,
        actor_id: ActorId,
        creation_task_exception: Option<gcs_core::serde::protobuf::RayException>,
    ) -> Result<()> {
        self.event_sender
            .post_event(GcsEvent::ActorCreationFailed {
                actor_id,
                creation_task_exception,
            })
            .await
    }

    pub fn inflight_attempts(&self, actor_id: &ActorId) -> usize {
        usize::from(self.inflight.contains_key(actor_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::mpsc;

    use gcs_core::serde::protobuf::*;

    use crate::raylet_client::RayletClientFactory;

    struct SlowRaylet {
        creation_calls: AtomicU32,
    }

    #[tonic::async_trait]
    impl crate::raylet_client::RayletClient for SlowRaylet {
        async fn request_resource_report(
            &self,
            _request: RequestResourceReportParams,
        ) -> Result<RequestResourceReportResult> {
            Ok(RequestResourceReportResult { resources: None })
        }

        async fn update_resource_usage(
            &self,
            _request: UpdateResourceUsageParams,
        ) -> Result<UpdateResourceUsageResult> {
            Ok(UpdateResourceUsageResult {})
        }

        async fn create_actor(
            &self,
            _request: CreateActorOnRayletParams,
        ) -> Result<CreateActorOnRayletResult> {
            self.creation_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(CreateActorOnRayletResult {
                worker_id: WorkerId::from_random().binary(),
                creation_task_exception: None,
            })
        }

        async fn kill_actor(
            &self,
            _request: KillActorParams,
        ) -> Result<KillActorResult> {
            Ok(KillActorResult {})
        }

        async fn prepare_bundle_resources(
            &self,
            _request: PrepareBundleResourcesParams,
        ) -> Result<PrepareBundleResourcesResult> {
            Ok(PrepareBundleResourcesResult { success: true })
        }

        async fn commit_bundle_resources(
            &self,
            _request: CommitBundleResourcesParams,
        ) -> Result<CommitBundleResourcesResult> {
            Ok(CommitBundleResourcesResult {})
        }

        async fn cancel_resource_reserve(
            &self,
            _request: CancelResourceReserveParams,
        ) -> Result<CancelResourceReserveResult> {
            Ok(CancelResourceReserveResult {})
        }
    }

    struct SlowRayletFactory {
        raylet: Arc<SlowRaylet>,
    }

    impl RayletClientFactory for SlowRayletFactory {
        fn create_client(
            &self,
            _address: &NodeAddress,
        ) -> Arc<dyn crate::raylet_client::RayletClient> {
            self.raylet.clone()
        }
    }

    #[tokio::test]
    async fn at_most_one_creation_attempt_per_actor() {
        let resource_manager = Arc::new(ResourceManager::new());
        let node_id = NodeId::from_random();
        resource_manager.on_node_add(
            node_id,
            &GcsNodeInfo {
                node_id: node_id.binary(),
                resources_total: [("CPU".to_owned(), 4.0)].into_iter().collect(),
                ..Default::default()
            },
        );

        let raylet = Arc::new(SlowRaylet {
            creation_calls: AtomicU32::new(0),
        });
        let pool = RayletClientPool::new(Arc::new(SlowRayletFactory {
            raylet: raylet.clone(),
        }));
        let (tx, mut rx) = mpsc::channel(16);
        let scheduler = ActorScheduler::new(
            resource_manager.clone(),
            pool,
            Arc::new(|_| {
                Some(NodeAddress {
                    ip: "10.0.0.1".to_owned(),
                    port: 9100,
                })
            }),
            EventSender::new(tx),
            1_000,
        );

        let actor_id = ActorId::from_random();
        let actor = ActorTableData {
            actor_id: actor_id.binary(),
            required_resources: [("CPU".to_owned(), 1.0)].into_iter().collect(),
            ..Default::default()
        };
        scheduler.schedule(&actor).await.unwrap();
        // The second attempt is a no-op while the first is in flight.
        scheduler.schedule(&actor).await.unwrap();
        assert_eq!(scheduler.inflight_attempts(&actor_id), 1);
        assert_eq!(
            resource_manager.get_node_resources(&node_id).unwrap().available["CPU"],
            3.0
        );

        match rx.recv().await.unwrap() {
            GcsEvent::ActorCreationSucceeded {
                actor_id: done, ..
            } => assert_eq!(done, actor_id),
            _ => panic!("expected a creation success"),
        }
        assert_eq!(raylet.creation_calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.inflight_attempts(&actor_id), 0);
    }

    #[tokio::test]
    async fn infeasible_actor_posts_a_failure() {
        let resource_manager = Arc::new(ResourceManager::new());
        let raylet = Arc::new(SlowRaylet {
            creation_calls: AtomicU32::new(0),
        });
        let pool = RayletClientPool::new(Arc::new(SlowRayletFactory { raylet }));
        let (tx, mut rx) = mpsc::channel(16);
        let scheduler = ActorScheduler::new(
            resource_manager,
            pool,
            Arc::new(|_| None),
            EventSender::new(tx),
            1_000,
        );

        let actor = ActorTableData {
            actor_id: ActorId::from_random().binary(),
            required_resources: [("CPU".to_owned(), 1.0)].into_iter().collect(),
            ..Default::default()
        };
        scheduler.schedule(&actor).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            GcsEvent::ActorCreationFailed {
                creation_task_exception: None,
                ..
            }
        ));
    }
}
