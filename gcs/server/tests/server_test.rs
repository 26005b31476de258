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

//! End-to-end scenarios against a running server with mock raylets and the
//! in-memory backing store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tonic::Request;

use gcs_core::error::Result;
use gcs_core::ids::{
    ActorId, BaseId, JobId, NodeId, PlacementGroupId, WorkerId,
};
use gcs_core::rpc::{
    ActorInfoGcs, HeartbeatInfoGcs, JobInfoGcs, NodeInfoGcs, PlacementGroupInfoGcs,
    WorkerInfoGcs,
};
use gcs_core::serde::decode_protobuf;
use gcs_core::serde::protobuf::*;

use gcs_server::config::GcsServerConfig;
use gcs_server::pubsub::{GcsPublisher, ACTOR_CHANNEL};
use gcs_server::raylet_client::{RayletClient, RayletClientFactory};
use gcs_server::server::GcsServer;
use gcs_server::storage::kv::{KvStoreClient, MemoryKvStore};
use gcs_server::storage::{GCS_SERVER_ADDRESS_KEY, INTERNAL_KV_TABLE};

// ---------------------------------------------------------------------------
// Mock raylets
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockRaylet {
    created_actors: Mutex<Vec<Vec<u8>>>,
}

#[tonic::async_trait]
impl RayletClient for MockRaylet {
    async fn request_resource_report(
        &self,
        _request: RequestResourceReportParams,
    ) -> Result<RequestResourceReportResult> {
        // The mock raylet has nothing new to report.
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
        request: CreateActorOnRayletParams,
    ) -> Result<CreateActorOnRayletResult> {
        let actor = request.actor.expect("actor spec");
        self.created_actors.lock().push(actor.actor_id.clone());
        Ok(CreateActorOnRayletResult {
            worker_id: WorkerId::from_random().binary(),
            creation_task_exception: None,
        })
    }

    async fn kill_actor(&self, _request: KillActorParams) -> Result<KillActorResult> {
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

#[derive(Default)]
struct MockRayletFactory {
    raylets: DashMap<String, Arc<MockRaylet>>,
}

impl MockRayletFactory {
    fn raylet(&self, address: &str) -> Arc<MockRaylet> {
        self.raylets
            .entry(address.to_owned())
            .or_default()
            .clone()
    }
}

impl RayletClientFactory for MockRayletFactory {
    fn create_client(&self, address: &NodeAddress) -> Arc<dyn RayletClient> {
        self.raylet(&format!("{}:{}", address.ip, address.port))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> GcsServerConfig {
    GcsServerConfig {
        heartbeat_interval_ms: 10,
        // Generous budget: nodes in these tests only die when a test makes
        // them die.
        num_heartbeats_timeout: 1000,
        raylet_report_resources_period_ms: 50,
        actor_gc_delay_ms: 60_000,
        ..Default::default()
    }
}

async fn start_server(
    config: GcsServerConfig,
) -> (GcsServer, Arc<MemoryKvStore>, Arc<MockRayletFactory>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemoryKvStore::new());
    let factory = Arc::new(MockRayletFactory::default());
    let server = GcsServer::start(config, store.clone(), factory.clone())
        .await
        .unwrap();
    (server, store, factory)
}

fn node_info(index: u8, cpus: f64) -> GcsNodeInfo {
    GcsNodeInfo {
        node_id: NodeId::from_binary(&[index; 28]).unwrap().binary(),
        address: Some(NodeAddress {
            ip: format!("10.0.0.{index}"),
            port: 9100,
        }),
        resources_total: [("CPU".to_owned(), cpus)].into_iter().collect(),
        state: GcsNodeState::Alive as i32,
    }
}

async fn register_node(server: &GcsServer, info: GcsNodeInfo) {
    server
        .register_node(Request::new(RegisterNodeParams {
            node_info: Some(info),
        }))
        .await
        .unwrap();
}

async fn submit_actor(
    server: &GcsServer,
    actor_id: ActorId,
    job_id: JobId,
    cpus: f64,
    max_restarts: i64,
) {
    server
        .register_actor(Request::new(RegisterActorParams {
            data: Some(ActorTableData {
                actor_id: actor_id.binary(),
                job_id: job_id.binary(),
                required_resources: [("CPU".to_owned(), cpus)].into_iter().collect(),
                max_restarts,
                ..Default::default()
            }),
        }))
        .await
        .unwrap();
    server
        .create_actor(Request::new(CreateActorParams {
            actor_id: actor_id.binary(),
        }))
        .await
        .unwrap();
}

async fn add_job(server: &GcsServer, job_id: JobId) {
    server
        .add_job(Request::new(AddJobParams {
            data: Some(JobTableData {
                job_id: job_id.binary(),
                ray_namespace: "it".to_owned(),
                ..Default::default()
            }),
        }))
        .await
        .unwrap();
}

/// Poll until `predicate` holds or the budget runs out.
async fn wait_for<F, Fut>(what: &str, predicate: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Registration is asynchronous: wait until the resource view has caught up
/// before submitting work against it.
async fn wait_for_view(server: &GcsServer, nodes: usize) {
    wait_for("resource view to settle", || async {
        server.resource_manager().cluster_view().len() == nodes
    })
    .await;
}

fn actor_state(server: &GcsServer, actor_id: &ActorId) -> Option<ActorState> {
    server
        .actor_manager()
        .get_actor(actor_id)
        .map(|actor| actor.state())
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Scenario 1: two nodes, one actor needing half a node. The actor lands on
/// the lower node id (equal capacity tie-break), the resource view reflects
/// the deduction, and the registration is published exactly once.
#[tokio::test]
async fn actor_is_scheduled_on_the_lower_node_id() {
    let (server, _store, factory) = start_server(test_config()).await;
    let mut subscription = server.publisher().subscribe(ACTOR_CHANNEL, None);

    register_node(&server, node_info(1, 4.0)).await;
    register_node(&server, node_info(2, 4.0)).await;
    wait_for_view(&server, 2).await;
    let n1 = NodeId::from_binary(&[1; 28]).unwrap();

    let actor_id = ActorId::from_random();
    let job_id = JobId::from_random();
    add_job(&server, job_id).await;
    submit_actor(&server, actor_id, job_id, 2.0, 0).await;

    wait_for("actor to become alive", || async {
        actor_state(&server, &actor_id) == Some(ActorState::Alive)
    })
    .await;

    let actor = server.actor_manager().get_actor(&actor_id).unwrap();
    assert_eq!(actor.node_id, n1.binary());
    let raylet = factory.raylet("10.0.0.1:9100");
    assert_eq!(raylet.created_actors.lock().len(), 1);

    let available = server
        .resource_manager()
        .get_node_resources(&n1)
        .unwrap()
        .available;
    assert_eq!(available["CPU"], 2.0);

    // Exactly one publication announced the new actor registration. Give
    // the fanout a beat to drain before reading.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut registrations = 0;
    while let Some(message) = subscription.try_next() {
        let data: ActorTableData = decode_protobuf(&message.payload).unwrap();
        if data.state() == ActorState::DependenciesUnready {
            registrations += 1;
        }
    }
    assert_eq!(registrations, 1);

    server.stop();
}

/// Scenario 2: the hosting node dies by heartbeat timeout. The actor goes
/// through RESTARTING back to PENDING_CREATION and lands on the surviving
/// node.
#[tokio::test]
async fn heartbeat_death_restarts_actors_on_the_survivor() {
    let config = GcsServerConfig {
        heartbeat_interval_ms: 10,
        num_heartbeats_timeout: 10,
        ..test_config()
    };
    let (server, _store, _factory) = start_server(config).await;
    let server = Arc::new(server);
    register_node(&server, node_info(1, 4.0)).await;
    register_node(&server, node_info(2, 4.0)).await;
    wait_for_view(&server, 2).await;
    let n1 = NodeId::from_binary(&[1; 28]).unwrap();
    let n2 = NodeId::from_binary(&[2; 28]).unwrap();

    // A background raylet fleet: both nodes heartbeat until the test stops
    // one of them.
    let beating = Arc::new(Mutex::new(vec![n1, n2]));
    let fleet = beating.clone();
    let heartbeat_server = server.clone();
    let keepalive = tokio::spawn(async move {
        loop {
            let nodes = fleet.lock().clone();
            for node_id in nodes {
                let _ = heartbeat_server
                    .report_heartbeat(Request::new(ReportHeartbeatParams {
                        node_id: node_id.binary(),
                    }))
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let actor_id = ActorId::from_random();
    let job_id = JobId::from_random();
    add_job(&server, job_id).await;
    submit_actor(&server, actor_id, job_id, 2.0, 1).await;
    wait_for("actor to become alive on n1", || async {
        server
            .actor_manager()
            .get_actor(&actor_id)
            .map(|actor| actor.state() == ActorState::Alive && actor.node_id == n1.binary())
            .unwrap_or(false)
    })
    .await;

    // n1 stops heartbeating; its deadline lapses.
    beating.lock().retain(|node_id| *node_id != n1);
    wait_for("n1 to be declared dead", || async {
        !server.node_manager().is_alive(&n1)
    })
    .await;

    wait_for("actor to come back on n2", || async {
        server
            .actor_manager()
            .get_actor(&actor_id)
            .map(|actor| {
                actor.state() == ActorState::Alive && actor.node_id == n2.binary()
            })
            .unwrap_or(false)
    })
    .await;

    let actor = server.actor_manager().get_actor(&actor_id).unwrap();
    assert_eq!(actor.num_restarts, 1);
    assert!(server.node_manager().is_alive(&n2));
    keepalive.abort();
    server.stop();
}

/// Scenario 3: a STRICT_SPREAD group over two bundles cannot be created on
/// one node; it stays PENDING until a second node registers.
#[tokio::test]
async fn strict_spread_waits_for_a_second_node() {
    let (server, _store, _factory) = start_server(test_config()).await;
    register_node(&server, node_info(1, 4.0)).await;
    wait_for_view(&server, 1).await;

    let pg_id = PlacementGroupId::from_random();
    let job_id = JobId::from_random();
    add_job(&server, job_id).await;
    server
        .create_placement_group(Request::new(CreatePlacementGroupParams {
            data: Some(PlacementGroupTableData {
                placement_group_id: pg_id.binary(),
                creator_job_id: job_id.binary(),
                strategy: PlacementStrategy::StrictSpread as i32,
                bundles: (0..2)
                    .map(|index| Bundle {
                        bundle_index: index,
                        unit_resources: [("CPU".to_owned(), 1.0)].into_iter().collect(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
        }))
        .await
        .unwrap();

    // One node cannot satisfy two strictly spread bundles.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let placement_group = server
        .placement_group_manager()
        .get_placement_group(&pg_id)
        .unwrap();
    assert_eq!(placement_group.state(), PlacementGroupState::Pending);

    register_node(&server, node_info(2, 4.0)).await;
    wait_for("placement group to be created", || async {
        server
            .placement_group_manager()
            .get_placement_group(&pg_id)
            .map(|placement_group| {
                placement_group.state() == PlacementGroupState::Created
            })
            .unwrap_or(false)
    })
    .await;

    let placement_group = server
        .placement_group_manager()
        .get_placement_group(&pg_id)
        .unwrap();
    let mut nodes: Vec<Vec<u8>> = placement_group
        .bundles
        .iter()
        .map(|bundle| bundle.node_id.clone())
        .collect();
    nodes.sort();
    nodes.dedup();
    assert_eq!(nodes.len(), 2, "one bundle per node");
    server.stop();
}

/// Scenario 4: finishing a job kills its actors and removes its placement
/// group without any worker death involved.
#[tokio::test]
async fn job_finish_cascades_to_actors_and_placement_groups() {
    let (server, _store, _factory) = start_server(test_config()).await;
    register_node(&server, node_info(1, 8.0)).await;
    wait_for_view(&server, 1).await;

    let job_id = JobId::from_random();
    add_job(&server, job_id).await;
    let a1 = ActorId::from_random();
    let a2 = ActorId::from_random();
    submit_actor(&server, a1, job_id, 1.0, 0).await;
    submit_actor(&server, a2, job_id, 1.0, 0).await;
    let pg_id = PlacementGroupId::from_random();
    server
        .create_placement_group(Request::new(CreatePlacementGroupParams {
            data: Some(PlacementGroupTableData {
                placement_group_id: pg_id.binary(),
                creator_job_id: job_id.binary(),
                strategy: PlacementStrategy::Pack as i32,
                bundles: vec![Bundle {
                    bundle_index: 0,
                    unit_resources: [("CPU".to_owned(), 1.0)].into_iter().collect(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }))
        .await
        .unwrap();

    wait_for("both actors alive and the group created", || async {
        actor_state(&server, &a1) == Some(ActorState::Alive)
            && actor_state(&server, &a2) == Some(ActorState::Alive)
            && server
                .placement_group_manager()
                .get_placement_group(&pg_id)
                .map(|placement_group| {
                    placement_group.state() == PlacementGroupState::Created
                })
                .unwrap_or(false)
    })
    .await;

    server
        .mark_job_finished(Request::new(MarkJobFinishedParams {
            job_id: job_id.binary(),
        }))
        .await
        .unwrap();

    wait_for("cascading cleanup", || async {
        actor_state(&server, &a1) == Some(ActorState::Dead)
            && actor_state(&server, &a2) == Some(ActorState::Dead)
            && server
                .placement_group_manager()
                .get_placement_group(&pg_id)
                .map(|placement_group| {
                    placement_group.state() == PlacementGroupState::Removed
                })
                .unwrap_or(false)
    })
    .await;
    server.stop();
}

/// Scenario 5: deleting a `gcs://` URI hits the store and reports whether
/// the key existed.
#[tokio::test]
async fn delete_uri_round_trip() {
    let (server, store, _factory) = start_server(test_config()).await;
    server
        .internal_kv()
        .put("gcs://foo", b"payload".to_vec(), true)
        .await
        .unwrap();
    assert!(server.internal_kv().delete_uri("gcs://foo").await.unwrap());
    assert!(!server.internal_kv().delete_uri("gcs://foo").await.unwrap());
    assert!(!store
        .exists(INTERNAL_KV_TABLE, b"gcs://foo")
        .await
        .unwrap());
    server.stop();
}

/// Worker death with a creation-task exception surfaces the exception on
/// the DEAD actor, visible to Get callers.
#[tokio::test]
async fn worker_death_records_the_creation_exception() {
    let (server, _store, _factory) = start_server(test_config()).await;
    register_node(&server, node_info(1, 4.0)).await;
    wait_for_view(&server, 1).await;

    let actor_id = ActorId::from_random();
    let job_id = JobId::from_random();
    add_job(&server, job_id).await;
    submit_actor(&server, actor_id, job_id, 1.0, 0).await;
    wait_for("actor alive", || async {
        actor_state(&server, &actor_id) == Some(ActorState::Alive)
    })
    .await;

    let actor = server.actor_manager().get_actor(&actor_id).unwrap();
    server
        .report_worker_failure(Request::new(ReportWorkerFailureParams {
            worker_failure: Some(WorkerTableData {
                worker_id: actor.worker_id.clone(),
                node_id: actor.node_id.clone(),
                is_alive: false,
                exit_type: WorkerExitType::CreationTaskFailed as i32,
                creation_task_exception: Some(RayException {
                    error_message: "init blew up".to_owned(),
                    formatted_exception: "RuntimeError: init blew up".to_owned(),
                }),
                ..Default::default()
            }),
        }))
        .await
        .unwrap();

    wait_for("actor dead with exception", || async {
        server
            .actor_manager()
            .get_actor(&actor_id)
            .map(|actor| {
                actor.state() == ActorState::Dead
                    && actor.creation_task_exception.is_some()
            })
            .unwrap_or(false)
    })
    .await;

    let result = server
        .get_actor_info(Request::new(GetActorInfoParams {
            actor_id: actor_id.binary(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        result
            .actor_table_data
            .unwrap()
            .creation_task_exception
            .unwrap()
            .error_message,
        "init blew up"
    );
    server.stop();
}

/// Restarting from the store: the rebooted server sees exactly the state
/// the first one persisted.
#[tokio::test]
async fn state_survives_a_server_restart() {
    let store = Arc::new(MemoryKvStore::new());
    let factory = Arc::new(MockRayletFactory::default());
    let job_id = JobId::from_random();
    let actor_id = ActorId::from_random();
    {
        let server =
            GcsServer::start(test_config(), store.clone(), factory.clone())
                .await
                .unwrap();
        register_node(&server, node_info(1, 4.0)).await;
        wait_for_view(&server, 1).await;
        add_job(&server, job_id).await;
        submit_actor(&server, actor_id, job_id, 1.0, 0).await;
        wait_for("actor alive", || async {
            actor_state(&server, &actor_id) == Some(ActorState::Alive)
        })
        .await;
        server.stop();
    }

    let server = GcsServer::start(test_config(), store, factory)
        .await
        .unwrap();
    assert_eq!(
        server.job_manager().get_ray_namespace(&job_id),
        Some("it".to_owned())
    );
    let actor = server.actor_manager().get_actor(&actor_id).unwrap();
    assert_eq!(actor.state(), ActorState::Alive);
    let n1 = NodeId::from_binary(&[1; 28]).unwrap();
    assert!(server.node_manager().is_alive(&n1));
    server.stop();
}

/// After Stop no timer fires and the advertised address key survives, so a
/// restarted server stays discoverable.
#[tokio::test]
async fn stop_keeps_the_address_key_and_silences_timers() {
    let (server, store, _factory) = start_server(test_config()).await;
    register_node(&server, node_info(1, 4.0)).await;
    let n1 = NodeId::from_binary(&[1; 28]).unwrap();
    server.stop();

    assert!(store
        .exists(INTERNAL_KV_TABLE, GCS_SERVER_ADDRESS_KEY)
        .await
        .unwrap());

    // Heartbeats are stopped: the node's deadline lapses with no effect.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.node_manager().is_alive(&n1));
}

/// The six scenarios run against the direct pub/sub plane too; this pins
/// the config switch and the one-registration publication on it.
#[tokio::test]
async fn direct_pubsub_sees_actor_registration() {
    let config = GcsServerConfig {
        grpc_pubsub_enabled: true,
        ..test_config()
    };
    let (server, _store, _factory) = start_server(config).await;
    let mut subscription = server.publisher().subscribe(ACTOR_CHANNEL, None);
    register_node(&server, node_info(1, 4.0)).await;
    wait_for_view(&server, 1).await;

    let actor_id = ActorId::from_random();
    let job_id = JobId::from_random();
    add_job(&server, job_id).await;
    submit_actor(&server, actor_id, job_id, 1.0, 0).await;
    wait_for("actor alive", || async {
        actor_state(&server, &actor_id) == Some(ActorState::Alive)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut states = vec![];
    while let Some(message) = subscription.try_next() {
        let data: ActorTableData = decode_protobuf(&message.payload).unwrap();
        if data.actor_id == actor_id.binary() {
            states.push(data.state());
        }
    }
    assert_eq!(
        states,
        vec![
            ActorState::DependenciesUnready,
            ActorState::PendingCreation,
            ActorState::Alive
        ]
    );
    server.stop();
}
