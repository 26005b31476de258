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

//! The actor registry and its state machine:
//!
//! DEPENDENCIES_UNREADY -> PENDING_CREATION -> ALIVE -> (RESTARTING ->
//! PENDING_CREATION)* -> DEAD
//!
//! The manager owns every transition; the scheduler only reports attempt
//! outcomes, and the server's event processor feeds in worker/node/job
//! deaths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use gcs_core::error::{GcsError, Result};
use gcs_core::ids::{ActorId, BaseId, JobId, NodeId, WorkerId};
use gcs_core::serde::encode_protobuf;
use gcs_core::serde::protobuf::{
    ActorState, ActorTableData, RayException, WorkerExitType,
};

use crate::init_data::GcsInitData;
use crate::pubsub::{ACTOR_CHANNEL, GcsPublisher};
use crate::storage::GcsTableStorage;
use crate::worker_manager::WorkerDeath;

/// Resolves a job id to its namespace; wired to the job manager by the
/// server.
pub type NamespaceResolver = Arc<dyn Fn(&JobId) -> Option<String> + Send + Sync>;

/// What a death or failure did to the actor set. `to_schedule` holds actors
/// pushed back to PENDING_CREATION that want a new placement attempt;
/// `destroyed` holds actors that reached DEAD, for the placement-group
/// cleanup fan-out.
#[derive(Default)]
pub struct ActorCascade {
    pub to_schedule: Vec<ActorTableData>,
    pub destroyed: Vec<ActorId>,
}

#[derive(Default)]
struct ActorIndexes {
    registered: HashMap<ActorId, ActorTableData>,
    /// (namespace, name) -> actor. The empty namespace is an ordinary key:
    /// it matches only the empty namespace.
    named: HashMap<(String, String), ActorId>,
    pending: VecDeque<ActorId>,
    by_node: HashMap<NodeId, HashSet<ActorId>>,
    by_worker: HashMap<WorkerId, ActorId>,
    by_job: HashMap<JobId, HashSet<ActorId>>,
}

pub struct ActorManager {
    indexes: RwLock<ActorIndexes>,
    storage: Arc<GcsTableStorage>,
    publisher: Arc<dyn GcsPublisher>,
    resolve_namespace: NamespaceResolver,
    gc_delay: Duration,
    /// DEAD actors awaiting their metadata sweep.
    gc_queue: Arc<Mutex<VecDeque<(Instant, ActorId)>>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl ActorManager {
    pub fn new(
        storage: Arc<GcsTableStorage>,
        publisher: Arc<dyn GcsPublisher>,
        resolve_namespace: NamespaceResolver,
        gc_delay_ms: u64,
    ) -> Self {
        Self {
            indexes: RwLock::new(ActorIndexes::default()),
            storage,
            publisher,
            resolve_namespace,
            gc_delay: Duration::from_millis(gc_delay_ms),
            gc_queue: Arc::new(Mutex::new(VecDeque::new())),
            gc_task: Mutex::new(None),
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        let mut indexes = self.indexes.write();
        for (actor_id, actor) in &init_data.actors {
            Self::index_actor(&mut indexes, *actor_id, actor);
            let mut actor = actor.clone();
            match actor.state() {
                // A restart interrupted mid-flight resumes as an ordinary
                // placement; the creation attempt it had is gone with the
                // old server.
                ActorState::PendingCreation | ActorState::Restarting => {
                    actor.set_state(ActorState::PendingCreation);
                    indexes.pending.push_back(*actor_id);
                }
                ActorState::DependenciesUnready
                | ActorState::Alive
                | ActorState::Dead => {}
            }
            indexes.registered.insert(*actor_id, actor);
        }
    }

    fn index_actor(indexes: &mut ActorIndexes, actor_id: ActorId, actor: &ActorTableData) {
        if let Ok(job_id) = JobId::from_binary(&actor.job_id) {
            indexes.by_job.entry(job_id).or_default().insert(actor_id);
        }
        if !actor.name.is_empty() && actor.state() != ActorState::Dead {
            indexes
                .named
                .insert((actor.ray_namespace.clone(), actor.name.clone()), actor_id);
        }
        if actor.state() == ActorState::Alive {
            if let Ok(node_id) = NodeId::from_binary(&actor.node_id) {
                indexes.by_node.entry(node_id).or_default().insert(actor_id);
            }
            if let Ok(worker_id) = WorkerId::from_binary(&actor.worker_id) {
                indexes.by_worker.insert(worker_id, actor_id);
            }
        }
    }

    /// Register a new actor in DEPENDENCIES_UNREADY. Name collisions within
    /// one namespace are Invalid; re-registering the same actor id is a
    /// no-op so retried RPCs stay safe.
    pub async fn register_actor(&self, mut actor: ActorTableData) -> Result<()> {
        let actor_id = ActorId::from_binary(&actor.actor_id)?;
        let job_id = JobId::from_binary(&actor.job_id)?;
        if actor.ray_namespace.is_empty() {
            actor.ray_namespace = (self.resolve_namespace)(&job_id).unwrap_or_default();
        }
        {
            let indexes = self.indexes.read();
            if indexes.registered.contains_key(&actor_id) {
                return Ok(());
            }
            if !actor.name.is_empty() {
                let key = (actor.ray_namespace.clone(), actor.name.clone());
                if let Some(existing) = indexes.named.get(&key) {
                    return Err(GcsError::Invalid(format!(
                        "actor name '{}' is already taken in namespace '{}' by {}",
                        actor.name, actor.ray_namespace, existing
                    )));
                }
            }
        }
        actor.set_state(ActorState::DependenciesUnready);
        self.persist_and_publish(actor_id, &actor).await?;
        let mut indexes = self.indexes.write();
        Self::index_actor(&mut indexes, actor_id, &actor);
        indexes.registered.insert(actor_id, actor);
        info!("Registered actor {}", actor_id);
        Ok(())
    }

    /// The actor's arguments resolved; move it to PENDING_CREATION and hand
    /// it to the caller for a placement attempt.
    pub async fn create_actor(&self, actor_id: ActorId) -> Result<ActorTableData> {
        let actor = {
            let indexes = self.indexes.read();
            let actor = indexes.registered.get(&actor_id).ok_or_else(|| {
                GcsError::NotFound(format!("actor {actor_id} is not registered"))
            })?;
            match actor.state() {
                ActorState::DependenciesUnready => {
                    let mut actor = actor.clone();
                    actor.set_state(ActorState::PendingCreation);
                    actor
                }
                ActorState::Dead => {
                    return Err(GcsError::Invalid(format!("actor {actor_id} is dead")))
                }
                _ => {
                    return Err(GcsError::Invalid(format!(
                        "actor {actor_id} is already being created"
                    )))
                }
            }
        };
        self.persist_and_publish(actor_id, &actor).await?;
        self.indexes
            .write()
            .registered
            .insert(actor_id, actor.clone());
        Ok(actor)
    }

    pub async fn on_actor_creation_success(
        &self,
        actor_id: ActorId,
        node_id: NodeId,
        worker_id: WorkerId,
    ) -> Result<()> {
        let actor = {
            let indexes = self.indexes.read();
            let Some(actor) = indexes.registered.get(&actor_id) else {
                // Destroyed while the creation RPC was in flight.
                return Ok(());
            };
            if actor.state() == ActorState::Dead {
                return Ok(());
            }
            let mut actor = actor.clone();
            actor.set_state(ActorState::Alive);
            actor.node_id = node_id.binary();
            actor.worker_id = worker_id.binary();
            actor
        };
        self.persist_and_publish(actor_id, &actor).await?;
        let mut indexes = self.indexes.write();
        indexes.by_node.entry(node_id).or_default().insert(actor_id);
        indexes.by_worker.insert(worker_id, actor_id);
        indexes.registered.insert(actor_id, actor);
        info!("Actor {} is alive on node {}", actor_id, node_id);
        Ok(())
    }

    /// A creation attempt failed. Without an exception the actor simply
    /// waits in PENDING_CREATION for the next chance (a new node, a retry).
    /// A creation-task exception burns a restart, and kills the actor when
    /// none remain.
    pub async fn on_actor_creation_failed(
        &self,
        actor_id: ActorId,
        creation_task_exception: Option<RayException>,
    ) -> Result<ActorCascade> {
        let mut cascade = ActorCascade::default();
        let current = {
            let indexes = self.indexes.read();
            match indexes.registered.get(&actor_id) {
                Some(actor) if actor.state() == ActorState::PendingCreation => {
                    actor.clone()
                }
                _ => return Ok(cascade),
            }
        };
        match creation_task_exception {
            None => {
                self.indexes.write().pending.push_back(actor_id);
            }
            Some(exception) if current.remaining_restarts() > 0 => {
                let mut actor = current;
                actor.num_restarts += 1;
                warn!(
                    "Creation task of actor {} failed ({} restarts left): {}",
                    actor_id,
                    actor.remaining_restarts(),
                    exception.error_message
                );
                self.persist_and_publish(actor_id, &actor).await?;
                let mut indexes = self.indexes.write();
                indexes.registered.insert(actor_id, actor);
                indexes.pending.push_back(actor_id);
            }
            Some(exception) => {
                self.destroy_actor(
                    actor_id,
                    "creation task failed and no restarts remain",
                    Some(exception),
                )
                .await?;
                cascade.destroyed.push(actor_id);
            }
        }
        Ok(cascade)
    }

    /// Drain the pending queue. Callers hand the result to the scheduler;
    /// actors that are no longer PENDING_CREATION fall out here.
    pub fn schedule_pending_actors(&self) -> Vec<ActorTableData> {
        let mut indexes = self.indexes.write();
        let pending: Vec<ActorId> = indexes.pending.drain(..).collect();
        pending
            .into_iter()
            .filter_map(|actor_id| {
                indexes.registered.get(&actor_id).and_then(|actor| {
                    (actor.state() == ActorState::PendingCreation)
                        .then(|| actor.clone())
                })
            })
            .collect()
    }

    pub async fn on_worker_dead(&self, death: &WorkerDeath) -> Result<ActorCascade> {
        let Some(actor_id) = self
            .indexes
            .write()
            .by_worker
            .remove(&death.worker_id)
        else {
            return Ok(ActorCascade::default());
        };
        self.restart_or_destroy(
            actor_id,
            death.creation_task_exception.clone(),
            &format!("worker {} died ({:?})", death.worker_id, death.exit_type),
        )
        .await
    }

    pub async fn on_node_dead(&self, node_id: &NodeId) -> Result<ActorCascade> {
        let actor_ids: Vec<ActorId> = {
            let mut indexes = self.indexes.write();
            indexes
                .by_node
                .remove(node_id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default()
        };
        let mut cascade = ActorCascade::default();
        for actor_id in actor_ids {
            let one = self
                .restart_or_destroy(actor_id, None, &format!("node {node_id} died"))
                .await?;
            cascade.to_schedule.extend(one.to_schedule);
            cascade.destroyed.extend(one.destroyed);
        }
        Ok(cascade)
    }

    async fn restart_or_destroy(
        &self,
        actor_id: ActorId,
        creation_task_exception: Option<RayException>,
        reason: &str,
    ) -> Result<ActorCascade> {
        let mut cascade = ActorCascade::default();
        let current = {
            let indexes = self.indexes.read();
            match indexes.registered.get(&actor_id) {
                Some(actor) if actor.state() == ActorState::Alive => actor.clone(),
                _ => return Ok(cascade),
            }
        };
        if current.remaining_restarts() > 0 {
            // ALIVE -> RESTARTING is published so subscribers see the
            // intermediate state, then the actor re-enters the pipeline.
            let mut restarting = current.clone();
            restarting.set_state(ActorState::Restarting);
            self.persist_and_publish(actor_id, &restarting).await?;

            let mut pending = restarting;
            pending.set_state(ActorState::PendingCreation);
            pending.num_restarts += 1;
            pending.node_id.clear();
            pending.worker_id.clear();
            self.persist_and_publish(actor_id, &pending).await?;

            info!(
                "Restarting actor {} after {} ({} restarts left)",
                actor_id,
                reason,
                pending.remaining_restarts()
            );
            let mut indexes = self.indexes.write();
            // The old assignment is gone; drop its index entries so a later
            // death of that node or worker cannot touch this actor again.
            if let Ok(node_id) = NodeId::from_binary(&current.node_id) {
                if let Some(set) = indexes.by_node.get_mut(&node_id) {
                    set.remove(&actor_id);
                }
            }
            if let Ok(worker_id) = WorkerId::from_binary(&current.worker_id) {
                indexes.by_worker.remove(&worker_id);
            }
            indexes.registered.insert(actor_id, pending.clone());
            indexes.pending.push_back(actor_id);
            cascade.to_schedule.push(pending);
        } else {
            self.destroy_actor(actor_id, reason, creation_task_exception)
                .await?;
            cascade.destroyed.push(actor_id);
        }
        Ok(cascade)
    }

    /// Job finished: every non-detached actor it owns dies. Detached actors
    /// outlive their driver.
    pub async fn on_job_finished(&self, job_id: &JobId) -> Result<Vec<ActorId>> {
        let actor_ids: Vec<ActorId> = {
            let indexes = self.indexes.read();
            indexes
                .by_job
                .get(job_id)
                .map(|set| {
                    set.iter()
                        .filter(|actor_id| {
                            indexes
                                .registered
                                .get(actor_id)
                                .map(|actor| {
                                    !actor.is_detached
                                        && actor.state() != ActorState::Dead
                                })
                                .unwrap_or(false)
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut destroyed = vec![];
        for actor_id in actor_ids {
            self.destroy_actor(actor_id, "owning job finished", None)
                .await?;
            destroyed.push(actor_id);
        }
        Ok(destroyed)
    }

    pub async fn kill_actor(&self, actor_id: ActorId) -> Result<()> {
        {
            let indexes = self.indexes.read();
            let actor = indexes.registered.get(&actor_id).ok_or_else(|| {
                GcsError::NotFound(format!("actor {actor_id} is not registered"))
            })?;
            if actor.state() == ActorState::Dead {
                return Ok(());
            }
        }
        self.destroy_actor(actor_id, "killed via RPC", None).await
    }

    async fn destroy_actor(
        &self,
        actor_id: ActorId,
        reason: &str,
        creation_task_exception: Option<RayException>,
    ) -> Result<()> {
        let dead = {
            let indexes = self.indexes.read();
            let Some(actor) = indexes.registered.get(&actor_id) else {
                return Ok(());
            };
            let mut dead = actor.clone();
            dead.set_state(ActorState::Dead);
            dead.death_reason = reason.to_owned();
            if creation_task_exception.is_some() {
                dead.creation_task_exception = creation_task_exception;
            }
            dead
        };
        self.persist_and_publish(actor_id, &dead).await?;

        let mut indexes = self.indexes.write();
        indexes
            .named
            .remove(&(dead.ray_namespace.clone(), dead.name.clone()));
        if let Ok(node_id) = NodeId::from_binary(&dead.node_id) {
            if let Some(set) = indexes.by_node.get_mut(&node_id) {
                set.remove(&actor_id);
            }
        }
        if let Ok(worker_id) = WorkerId::from_binary(&dead.worker_id) {
            indexes.by_worker.remove(&worker_id);
        }
        indexes.pending.retain(|pending| *pending != actor_id);
        indexes.registered.insert(actor_id, dead);
        drop(indexes);

        warn!("Actor {} is dead: {}", actor_id, reason);
        self.gc_queue
            .lock()
            .push_back((Instant::now() + self.gc_delay, actor_id));
        Ok(())
    }

    async fn persist_and_publish(
        &self,
        actor_id: ActorId,
        actor: &ActorTableData,
    ) -> Result<()> {
        self.storage.actor_table().put(&actor_id, actor).await?;
        self.publisher
            .publish(ACTOR_CHANNEL, actor_id.as_bytes(), encode_protobuf(actor))
            .await
    }

    // -- reads ------------------------------------------------------------

    pub fn get_actor(&self, actor_id: &ActorId) -> Option<ActorTableData> {
        self.indexes.read().registered.get(actor_id).cloned()
    }

    /// Named lookup, scoped to the namespace. The empty namespace matches
    /// only actors registered with the empty namespace.
    pub fn get_named_actor(&self, name: &str, namespace: &str) -> Option<ActorTableData> {
        let indexes = self.indexes.read();
        indexes
            .named
            .get(&(namespace.to_owned(), name.to_owned()))
            .and_then(|actor_id| indexes.registered.get(actor_id))
            .cloned()
    }

    pub fn get_all_actors(&self) -> Vec<ActorTableData> {
        self.indexes.read().registered.values().cloned().collect()
    }

    pub fn actors_on_node(&self, node_id: &NodeId) -> usize {
        self.indexes
            .read()
            .by_node
            .get(node_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    // -- metadata GC ------------------------------------------------------

    /// Start the delayed sweep of DEAD actor metadata.
    pub fn start_gc(self: Arc<Self>) {
        let mut gc_task = self.gc_task.lock();
        if gc_task.is_some() {
            return;
        }
        let manager = Arc::downgrade(&self);
        let gc_queue = self.gc_queue.clone();
        *gc_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                let due: Vec<ActorId> = {
                    let mut queue = gc_queue.lock();
                    let now = Instant::now();
                    let mut due = vec![];
                    while let Some((deadline, actor_id)) = queue.front().copied() {
                        if now < deadline {
                            break;
                        }
                        queue.pop_front();
                        due.push(actor_id);
                    }
                    due
                };
                if due.is_empty() {
                    continue;
                }
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if let Err(e) = manager.sweep_dead_actors(&due).await {
                    warn!("Failed to sweep dead actor metadata: {}", e);
                }
            }
        }));
    }

    /// Stop the sweep. Pending timers are dropped; that only delays cleanup
    /// until the next boot.
    pub fn stop_gc(&self) {
        if let Some(handle) = self.gc_task.lock().take() {
            handle.abort();
            warn!("Actor metadata garbage collection cancelled; DEAD actor metadata may linger until restart");
        }
    }

    async fn sweep_dead_actors(&self, actor_ids: &[ActorId]) -> Result<()> {
        let swept: Vec<ActorId> = {
            let mut indexes = self.indexes.write();
            let dead: Vec<ActorId> = actor_ids
                .iter()
                .filter(|actor_id| {
                    indexes
                        .registered
                        .get(actor_id)
                        .map(|actor| actor.state() == ActorState::Dead)
                        .unwrap_or(false)
                })
                .copied()
                .collect();
            for actor_id in &dead {
                indexes.registered.remove(actor_id);
            }
            dead
        };
        if swept.is_empty() {
            return Ok(());
        }
        info!("Sweeping metadata of {} dead actors", swept.len());
        self.storage.actor_table().batch_delete(&swept).await
    }

    pub fn debug_string(&self) -> String {
        let indexes = self.indexes.read();
        let alive = indexes
            .registered
            .values()
            .filter(|actor| actor.state() == ActorState::Alive)
            .count();
        format!(
            "ActorManager {{ registered: {}, alive: {}, pending: {}, named: {} }}",
            indexes.registered.len(),
            alive,
            indexes.pending.len(),
            indexes.named.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::DirectPublisher;
    use crate::storage::kv::MemoryKvStore;
    use crate::storage::RetryPolicy;

    fn manager() -> Arc<ActorManager> {
        let storage = Arc::new(GcsTableStorage::new(
            Arc::new(MemoryKvStore::new()),
            RetryPolicy::new(1, 3),
        ));
        let publisher = Arc::new(DirectPublisher::new(Duration::from_secs(10), 100));
        Arc::new(ActorManager::new(
            storage,
            publisher,
            Arc::new(|_| Some("default".to_owned())),
            50,
        ))
    }

    fn actor(actor_id: ActorId, job_id: JobId, max_restarts: i64) -> ActorTableData {
        ActorTableData {
            actor_id: actor_id.binary(),
            job_id: job_id.binary(),
            max_restarts,
            required_resources: [("CPU".to_owned(), 1.0)].into_iter().collect(),
            ..Default::default()
        }
    }

    async fn make_alive(
        manager: &Arc<ActorManager>,
        actor_id: ActorId,
        node_id: NodeId,
        worker_id: WorkerId,
    ) {
        manager.create_actor(actor_id).await.unwrap();
        manager
            .on_actor_creation_success(actor_id, node_id, worker_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lifecycle_to_alive() {
        let manager = manager();
        let actor_id = ActorId::from_random();
        manager
            .register_actor(actor(actor_id, JobId::from_random(), 0))
            .await
            .unwrap();
        assert_eq!(
            manager.get_actor(&actor_id).unwrap().state(),
            ActorState::DependenciesUnready
        );

        let pending = manager.create_actor(actor_id).await.unwrap();
        assert_eq!(pending.state(), ActorState::PendingCreation);

        manager
            .on_actor_creation_success(
                actor_id,
                NodeId::from_random(),
                WorkerId::from_random(),
            )
            .await
            .unwrap();
        assert_eq!(
            manager.get_actor(&actor_id).unwrap().state(),
            ActorState::Alive
        );
    }

    #[tokio::test]
    async fn namespace_is_resolved_from_the_job() {
        let manager = manager();
        let actor_id = ActorId::from_random();
        let mut data = actor(actor_id, JobId::from_random(), 0);
        data.name = "trainer".to_owned();
        manager.register_actor(data).await.unwrap();
        assert!(manager.get_named_actor("trainer", "default").is_some());
        assert!(manager.get_named_actor("trainer", "").is_none());
    }

    #[tokio::test]
    async fn name_collisions_within_a_namespace_are_invalid() {
        let manager = manager();
        let job_id = JobId::from_random();
        let mut first = actor(ActorId::from_random(), job_id, 0);
        first.name = "singleton".to_owned();
        first.ray_namespace = "ns-a".to_owned();
        manager.register_actor(first).await.unwrap();

        let mut duplicate = actor(ActorId::from_random(), job_id, 0);
        duplicate.name = "singleton".to_owned();
        duplicate.ray_namespace = "ns-a".to_owned();
        let err = manager.register_actor(duplicate).await.unwrap_err();
        assert_eq!(err.kind(), gcs_core::error::ErrorKind::Invalid);

        // The same name in a different namespace is fine.
        let mut other_namespace = actor(ActorId::from_random(), job_id, 0);
        other_namespace.name = "singleton".to_owned();
        other_namespace.ray_namespace = "ns-b".to_owned();
        manager.register_actor(other_namespace).await.unwrap();
    }

    #[tokio::test]
    async fn worker_death_restarts_while_budget_remains() {
        let manager = manager();
        let actor_id = ActorId::from_random();
        let node_id = NodeId::from_random();
        let worker_id = WorkerId::from_random();
        manager
            .register_actor(actor(actor_id, JobId::from_random(), 1))
            .await
            .unwrap();
        make_alive(&manager, actor_id, node_id, worker_id).await;

        let death = WorkerDeath {
            worker_id,
            node_id,
            exit_type: WorkerExitType::UnexpectedSystemExit,
            creation_task_exception: None,
        };
        let cascade = manager.on_worker_dead(&death).await.unwrap();
        assert_eq!(cascade.to_schedule.len(), 1);
        assert!(cascade.destroyed.is_empty());
        let restarted = manager.get_actor(&actor_id).unwrap();
        assert_eq!(restarted.state(), ActorState::PendingCreation);
        assert_eq!(restarted.num_restarts, 1);
        assert_eq!(restarted.remaining_restarts(), 0);

        // Second death: the budget is gone, the actor dies. (The restarted
        // actor is already PENDING_CREATION, so only the placement attempt
        // outcome is replayed here.)
        manager
            .on_actor_creation_success(actor_id, node_id, worker_id)
            .await
            .unwrap();
        let cascade = manager.on_worker_dead(&death).await.unwrap();
        assert_eq!(cascade.destroyed, vec![actor_id]);
        assert_eq!(
            manager.get_actor(&actor_id).unwrap().state(),
            ActorState::Dead
        );
    }

    #[tokio::test]
    async fn node_death_kills_non_restartable_actors() {
        let manager = manager();
        let actor_id = ActorId::from_random();
        let node_id = NodeId::from_random();
        manager
            .register_actor(actor(actor_id, JobId::from_random(), 0))
            .await
            .unwrap();
        make_alive(&manager, actor_id, node_id, WorkerId::from_random()).await;

        let cascade = manager.on_node_dead(&node_id).await.unwrap();
        assert_eq!(cascade.destroyed, vec![actor_id]);
        let dead = manager.get_actor(&actor_id).unwrap();
        assert_eq!(dead.state(), ActorState::Dead);
        assert!(dead.death_reason.contains("node"));
    }

    #[tokio::test]
    async fn job_finish_kills_owned_actors_but_not_detached() {
        let manager = manager();
        let job_id = JobId::from_random();
        let owned = ActorId::from_random();
        let detached = ActorId::from_random();
        manager
            .register_actor(actor(owned, job_id, 0))
            .await
            .unwrap();
        let mut detached_data = actor(detached, job_id, 0);
        detached_data.is_detached = true;
        manager.register_actor(detached_data).await.unwrap();

        let destroyed = manager.on_job_finished(&job_id).await.unwrap();
        assert_eq!(destroyed, vec![owned]);
        assert_eq!(
            manager.get_actor(&owned).unwrap().state(),
            ActorState::Dead
        );
        assert_ne!(
            manager.get_actor(&detached).unwrap().state(),
            ActorState::Dead
        );
    }

    #[tokio::test]
    async fn creation_exception_is_recorded_on_the_dead_actor() {
        let manager = manager();
        let actor_id = ActorId::from_random();
        manager
            .register_actor(actor(actor_id, JobId::from_random(), 0))
            .await
            .unwrap();
        manager.create_actor(actor_id).await.unwrap();

        let cascade = manager
            .on_actor_creation_failed(
                actor_id,
                Some(RayException {
                    error_message: "init raised".to_owned(),
                    formatted_exception: "RuntimeError: init raised".to_owned(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(cascade.destroyed, vec![actor_id]);
        let dead = manager.get_actor(&actor_id).unwrap();
        assert_eq!(dead.state(), ActorState::Dead);
        assert_eq!(
            dead.creation_task_exception.unwrap().error_message,
            "init raised"
        );
    }

    #[tokio::test]
    async fn scheduling_failure_requeues_without_burning_restarts() {
        let manager = manager();
        let actor_id = ActorId::from_random();
        manager
            .register_actor(actor(actor_id, JobId::from_random(), 0))
            .await
            .unwrap();
        manager.create_actor(actor_id).await.unwrap();

        manager
            .on_actor_creation_failed(actor_id, None)
            .await
            .unwrap();
        let requeued = manager.schedule_pending_actors();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].num_restarts, 0);
        // The queue drained; a second call hands out nothing.
        assert!(manager.schedule_pending_actors().is_empty());
    }

    #[tokio::test]
    async fn dead_actor_metadata_is_swept_after_the_grace() {
        let manager = manager();
        let actor_id = ActorId::from_random();
        manager
            .register_actor(actor(actor_id, JobId::from_random(), 0))
            .await
            .unwrap();
        manager.kill_actor(actor_id).await.unwrap();
        assert!(manager.get_actor(&actor_id).is_some());

        manager.clone().start_gc();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(manager.get_actor(&actor_id).is_none());
        manager.stop_gc();
    }
}
