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

//! Placement group registry and state machine. Groups are scheduled one at
//! a time; a failed attempt keeps the group PENDING and is retried when the
//! cluster changes. A node death under a CREATED group moves it to
//! RESCHEDULING, keeping the surviving bundles where they are.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use gcs_core::error::{GcsError, Result};
use gcs_core::ids::{ActorId, BaseId, JobId, NodeId, PlacementGroupId};
use gcs_core::serde::encode_protobuf;
use gcs_core::serde::protobuf::{
    BundleState, PlacementGroupState, PlacementGroupTableData,
};

use crate::init_data::GcsInitData;
use crate::pubsub::{GcsPublisher, PLACEMENT_GROUP_CHANNEL};
use crate::resource_manager::ResourceManager;
use crate::storage::GcsTableStorage;

#[derive(Default)]
struct PgIndexes {
    registered: HashMap<PlacementGroupId, PlacementGroupTableData>,
    pending: VecDeque<PlacementGroupId>,
    by_creator_job: HashMap<JobId, HashSet<PlacementGroupId>>,
    by_creator_actor: HashMap<ActorId, HashSet<PlacementGroupId>>,
}

pub struct PlacementGroupManager {
    indexes: RwLock<PgIndexes>,
    /// The group currently being scheduled; placement attempts run one at
    /// a time.
    scheduling_in_progress: Mutex<Option<PlacementGroupId>>,
    storage: Arc<GcsTableStorage>,
    publisher: Arc<dyn GcsPublisher>,
    resource_manager: Arc<ResourceManager>,
    remove_detached_on_job_finish: bool,
}

impl PlacementGroupManager {
    pub fn new(
        storage: Arc<GcsTableStorage>,
        publisher: Arc<dyn GcsPublisher>,
        resource_manager: Arc<ResourceManager>,
        remove_detached_on_job_finish: bool,
    ) -> Self {
        Self {
            indexes: RwLock::new(PgIndexes::default()),
            scheduling_in_progress: Mutex::new(None),
            storage,
            publisher,
            resource_manager,
            remove_detached_on_job_finish,
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        let mut indexes = self.indexes.write();
        for (pg_id, placement_group) in &init_data.placement_groups {
            Self::index_group(&mut indexes, *pg_id, placement_group);
            match placement_group.state() {
                PlacementGroupState::Pending | PlacementGroupState::Rescheduling => {
                    indexes.pending.push_back(*pg_id)
                }
                PlacementGroupState::Created | PlacementGroupState::Removed => {}
            }
            indexes.registered.insert(*pg_id, placement_group.clone());
        }
    }

    fn index_group(
        indexes: &mut PgIndexes,
        pg_id: PlacementGroupId,
        placement_group: &PlacementGroupTableData,
    ) {
        if let Ok(job_id) = JobId::from_binary(&placement_group.creator_job_id) {
            indexes.by_creator_job.entry(job_id).or_default().insert(pg_id);
        }
        if let Ok(actor_id) = ActorId::from_binary(&placement_group.creator_actor_id) {
            indexes
                .by_creator_actor
                .entry(actor_id)
                .or_default()
                .insert(pg_id);
        }
    }

    pub async fn create_placement_group(
        &self,
        mut placement_group: PlacementGroupTableData,
    ) -> Result<()> {
        let pg_id =
            PlacementGroupId::from_binary(&placement_group.placement_group_id)?;
        if placement_group.bundles.is_empty() {
            return Err(GcsError::Invalid(format!(
                "placement group {pg_id} has no bundles"
            )));
        }
        if self.indexes.read().registered.contains_key(&pg_id) {
            return Ok(());
        }
        placement_group.set_state(PlacementGroupState::Pending);
        for bundle in &mut placement_group.bundles {
            bundle.set_state(BundleState::Unscheduled);
            bundle.node_id.clear();
        }
        self.persist_and_publish(pg_id, &placement_group).await?;
        let mut indexes = self.indexes.write();
        Self::index_group(&mut indexes, pg_id, &placement_group);
        indexes.registered.insert(pg_id, placement_group);
        indexes.pending.push_back(pg_id);
        info!("Registered placement group {}", pg_id);
        Ok(())
    }

    /// Hand out the next group to schedule, if no attempt is running.
    pub fn next_pending_placement_group(&self) -> Option<PlacementGroupTableData> {
        let mut in_progress = self.scheduling_in_progress.lock();
        if in_progress.is_some() {
            return None;
        }
        let mut indexes = self.indexes.write();
        while let Some(pg_id) = indexes.pending.pop_front() {
            if let Some(placement_group) = indexes.registered.get(&pg_id) {
                match placement_group.state() {
                    PlacementGroupState::Pending | PlacementGroupState::Rescheduling => {
                        *in_progress = Some(pg_id);
                        return Some(placement_group.clone());
                    }
                    _ => {}
                }
            }
        }
        None
    }

    /// Apply a successful attempt. Returns false when the group was removed
    /// while the attempt was in flight; the caller must then release the
    /// placements it acquired.
    pub async fn on_scheduling_success(
        &self,
        pg_id: PlacementGroupId,
        placements: &[(u32, NodeId)],
    ) -> Result<bool> {
        self.clear_in_progress(pg_id);
        let updated = {
            let indexes = self.indexes.read();
            let Some(placement_group) = indexes.registered.get(&pg_id) else {
                return Ok(false);
            };
            if placement_group.state() == PlacementGroupState::Removed {
                return Ok(false);
            }
            let mut updated = placement_group.clone();
            for (bundle_index, node_id) in placements {
                if let Some(bundle) = updated
                    .bundles
                    .iter_mut()
                    .find(|bundle| bundle.bundle_index == *bundle_index)
                {
                    bundle.node_id = node_id.binary();
                    bundle.set_state(BundleState::Placed);
                }
            }
            updated.set_state(PlacementGroupState::Created);
            updated
        };
        self.persist_and_publish(pg_id, &updated).await?;
        self.indexes.write().registered.insert(pg_id, updated);
        info!("Placement group {} is created", pg_id);
        Ok(true)
    }

    /// A failed attempt: the group stays in its waiting state and queues up
    /// for the next try.
    pub fn on_scheduling_failed(&self, pg_id: PlacementGroupId) {
        self.clear_in_progress(pg_id);
        let mut indexes = self.indexes.write();
        let Some(placement_group) = indexes.registered.get(&pg_id) else {
            return;
        };
        match placement_group.state() {
            PlacementGroupState::Pending | PlacementGroupState::Rescheduling => {
                if !indexes.pending.contains(&pg_id) {
                    indexes.pending.push_back(pg_id);
                }
            }
            _ => {}
        }
    }

    fn clear_in_progress(&self, pg_id: PlacementGroupId) {
        let mut in_progress = self.scheduling_in_progress.lock();
        if *in_progress == Some(pg_id) {
            *in_progress = None;
        }
    }

    /// Release the capacity deducted for `placements`. Used when an attempt
    /// completed against a group that no longer wants it.
    pub fn release_bundle_resources(
        &self,
        pg_id: PlacementGroupId,
        placements: &[(u32, NodeId)],
    ) {
        let indexes = self.indexes.read();
        let Some(placement_group) = indexes.registered.get(&pg_id) else {
            return;
        };
        for (bundle_index, node_id) in placements {
            if let Some(bundle) = placement_group
                .bundles
                .iter()
                .find(|bundle| bundle.bundle_index == *bundle_index)
            {
                self.resource_manager
                    .release_resources(node_id, &bundle.unit_resources);
            }
        }
    }

    /// Remove a group. Idempotent; committed capacity returns to the
    /// resource view. Returns the record as it was before removal so the
    /// caller can cancel raylet-side reservations.
    pub async fn remove_placement_group(
        &self,
        pg_id: PlacementGroupId,
    ) -> Result<Option<PlacementGroupTableData>> {
        let before = {
            let indexes = self.indexes.read();
            match indexes.registered.get(&pg_id) {
                None => return Ok(None),
                Some(placement_group)
                    if placement_group.state() == PlacementGroupState::Removed =>
                {
                    return Ok(None)
                }
                Some(placement_group) => placement_group.clone(),
            }
        };
        for bundle in &before.bundles {
            if bundle.state() == BundleState::Placed {
                if let Ok(node_id) = NodeId::from_binary(&bundle.node_id) {
                    self.resource_manager
                        .release_resources(&node_id, &bundle.unit_resources);
                }
            }
        }
        let mut removed = before.clone();
        removed.set_state(PlacementGroupState::Removed);
        for bundle in &mut removed.bundles {
            bundle.set_state(BundleState::Unscheduled);
            bundle.node_id.clear();
        }
        self.persist_and_publish(pg_id, &removed).await?;
        {
            let mut indexes = self.indexes.write();
            indexes.pending.retain(|pending| *pending != pg_id);
            indexes.registered.insert(pg_id, removed);
        }
        info!("Removed placement group {}", pg_id);
        Ok(Some(before))
    }

    /// A node died. CREATED groups with bundles there keep their surviving
    /// bundles and go to RESCHEDULING at the front of the queue.
    pub async fn on_node_dead(&self, node_id: &NodeId) -> Result<Vec<PlacementGroupId>> {
        let affected: Vec<(PlacementGroupId, PlacementGroupTableData)> = {
            let indexes = self.indexes.read();
            indexes
                .registered
                .iter()
                .filter(|(_, placement_group)| {
                    placement_group.state() == PlacementGroupState::Created
                        && placement_group.bundles.iter().any(|bundle| {
                            bundle.state() == BundleState::Placed
                                && bundle.node_id == node_id.as_bytes()
                        })
                })
                .map(|(pg_id, placement_group)| (*pg_id, placement_group.clone()))
                .collect()
        };
        let mut rescheduling = vec![];
        for (pg_id, mut placement_group) in affected {
            for bundle in &mut placement_group.bundles {
                if bundle.node_id == node_id.as_bytes() {
                    bundle.set_state(BundleState::Unscheduled);
                    bundle.node_id.clear();
                }
            }
            placement_group.set_state(PlacementGroupState::Rescheduling);
            warn!(
                "Placement group {} lost bundles on node {}, rescheduling",
                pg_id, node_id
            );
            self.persist_and_publish(pg_id, &placement_group).await?;
            let mut indexes = self.indexes.write();
            indexes.registered.insert(pg_id, placement_group);
            // Rescheduling takes priority over first-time placement.
            indexes.pending.push_front(pg_id);
            rescheduling.push(pg_id);
        }
        Ok(rescheduling)
    }

    /// Owning job finished. Non-detached groups go away; detached groups
    /// follow the configured policy.
    pub async fn clean_on_job_dead(
        &self,
        job_id: &JobId,
    ) -> Result<Vec<PlacementGroupTableData>> {
        let candidates: Vec<PlacementGroupId> = {
            let indexes = self.indexes.read();
            indexes
                .by_creator_job
                .get(job_id)
                .map(|set| {
                    set.iter()
                        .filter(|pg_id| {
                            indexes
                                .registered
                                .get(pg_id)
                                .map(|placement_group| {
                                    !placement_group.is_detached
                                        || self.remove_detached_on_job_finish
                                })
                                .unwrap_or(false)
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut removed = vec![];
        for pg_id in candidates {
            if let Some(before) = self.remove_placement_group(pg_id).await? {
                removed.push(before);
            }
        }
        Ok(removed)
    }

    /// Creating actor died. Its non-detached groups go away.
    pub async fn clean_on_actor_dead(
        &self,
        actor_id: &ActorId,
    ) -> Result<Vec<PlacementGroupTableData>> {
        let candidates: Vec<PlacementGroupId> = {
            let indexes = self.indexes.read();
            indexes
                .by_creator_actor
                .get(actor_id)
                .map(|set| {
                    set.iter()
                        .filter(|pg_id| {
                            indexes
                                .registered
                                .get(pg_id)
                                .map(|placement_group| !placement_group.is_detached)
                                .unwrap_or(false)
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut removed = vec![];
        for pg_id in candidates {
            if let Some(before) = self.remove_placement_group(pg_id).await? {
                removed.push(before);
            }
        }
        Ok(removed)
    }

    async fn persist_and_publish(
        &self,
        pg_id: PlacementGroupId,
        placement_group: &PlacementGroupTableData,
    ) -> Result<()> {
        self.storage
            .placement_group_table()
            .put(&pg_id, placement_group)
            .await?;
        self.publisher
            .publish(
                PLACEMENT_GROUP_CHANNEL,
                pg_id.as_bytes(),
                encode_protobuf(placement_group),
            )
            .await
    }

    pub fn get_placement_group(
        &self,
        pg_id: &PlacementGroupId,
    ) -> Option<PlacementGroupTableData> {
        self.indexes.read().registered.get(pg_id).cloned()
    }

    pub fn get_all_placement_groups(&self) -> Vec<PlacementGroupTableData> {
        self.indexes.read().registered.values().cloned().collect()
    }

    pub fn debug_string(&self) -> String {
        let indexes = self.indexes.read();
        let created = indexes
            .registered
            .values()
            .filter(|placement_group| {
                placement_group.state() == PlacementGroupState::Created
            })
            .count();
        format!(
            "PlacementGroupManager {{ registered: {}, created: {}, pending: {} }}",
            indexes.registered.len(),
            created,
            indexes.pending.len()
        )
    }
}
