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

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use gcs_core::error::{GcsError, Result};
use gcs_core::ids::{BaseId, JobId};
use gcs_core::serde::encode_protobuf;
use gcs_core::serde::protobuf::{JobState, JobTableData};

use crate::init_data::GcsInitData;
use crate::pubsub::{GcsPublisher, JOB_CHANNEL};
use crate::storage::GcsTableStorage;

pub struct JobManager {
    jobs: RwLock<HashMap<JobId, JobTableData>>,
    storage: Arc<GcsTableStorage>,
    publisher: Arc<dyn GcsPublisher>,
}

impl JobManager {
    pub fn new(storage: Arc<GcsTableStorage>, publisher: Arc<dyn GcsPublisher>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            storage,
            publisher,
        }
    }

    pub fn initialize(&self, init_data: &GcsInitData) {
        self.jobs.write().extend(
            init_data
                .jobs
                .iter()
                .map(|(job_id, job)| (*job_id, job.clone())),
        );
    }

    pub async fn add_job(&self, job: JobTableData) -> Result<()> {
        let job_id = JobId::from_binary(&job.job_id)?;
        if self.jobs.read().contains_key(&job_id) {
            return Err(GcsError::Invalid(format!(
                "job {job_id} is already registered"
            )));
        }
        self.storage.job_table().put(&job_id, &job).await?;
        self.publisher
            .publish(JOB_CHANNEL, job_id.as_bytes(), encode_protobuf(&job))
            .await?;
        info!(
            "Added job {} in namespace '{}'",
            job_id, job.ray_namespace
        );
        self.jobs.write().insert(job_id, job);
        Ok(())
    }

    /// Mark the job FINISHED. Idempotent: finishing a finished or unknown
    /// job changes nothing and reports that no cascade is needed.
    pub async fn mark_job_finished(&self, job_id: JobId) -> Result<bool> {
        let finished = {
            let jobs = self.jobs.read();
            match jobs.get(&job_id) {
                None => return Ok(false),
                Some(job) if job.state() == JobState::Finished => return Ok(false),
                Some(job) => {
                    let mut finished = job.clone();
                    finished.set_state(JobState::Finished);
                    finished
                }
            }
        };
        // The table write commits before listeners observe the transition.
        self.storage.job_table().put(&job_id, &finished).await?;
        self.publisher
            .publish(JOB_CHANNEL, job_id.as_bytes(), encode_protobuf(&finished))
            .await?;
        self.jobs.write().insert(job_id, finished);
        info!("Job {} finished", job_id);
        Ok(true)
    }

    pub fn get_ray_namespace(&self, job_id: &JobId) -> Option<String> {
        self.jobs
            .read()
            .get(job_id)
            .map(|job| job.ray_namespace.clone())
    }

    pub fn get_job(&self, job_id: &JobId) -> Option<JobTableData> {
        self.jobs.read().get(job_id).cloned()
    }

    pub fn get_all_jobs(&self) -> Vec<JobTableData> {
        self.jobs.read().values().cloned().collect()
    }

    pub fn debug_string(&self) -> String {
        let jobs = self.jobs.read();
        let finished = jobs
            .values()
            .filter(|job| job.state() == JobState::Finished)
            .count();
        format!(
            "JobManager {{ jobs: {}, finished: {} }}",
            jobs.len(),
            finished
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::pubsub::DirectPublisher;
    use crate::storage::kv::MemoryKvStore;
    use crate::storage::RetryPolicy;

    fn manager() -> JobManager {
        let storage = Arc::new(GcsTableStorage::new(
            Arc::new(MemoryKvStore::new()),
            RetryPolicy::new(1, 3),
        ));
        let publisher = Arc::new(DirectPublisher::new(Duration::from_secs(10), 100));
        JobManager::new(storage, publisher)
    }

    fn job(job_id: JobId, namespace: &str) -> JobTableData {
        JobTableData {
            job_id: job_id.binary(),
            ray_namespace: namespace.to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_job_then_namespace_lookup() {
        let manager = manager();
        let job_id = JobId::from_random();
        manager.add_job(job(job_id, "team-a")).await.unwrap();
        assert_eq!(
            manager.get_ray_namespace(&job_id),
            Some("team-a".to_owned())
        );
        assert_eq!(manager.get_ray_namespace(&JobId::from_random()), None);
    }

    #[tokio::test]
    async fn duplicate_add_is_invalid() {
        let manager = manager();
        let job_id = JobId::from_random();
        manager.add_job(job(job_id, "ns")).await.unwrap();
        assert!(manager.add_job(job(job_id, "ns")).await.is_err());
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let manager = manager();
        let job_id = JobId::from_random();
        manager.add_job(job(job_id, "ns")).await.unwrap();

        assert!(manager.mark_job_finished(job_id).await.unwrap());
        assert_eq!(
            manager.get_job(&job_id).unwrap().state(),
            JobState::Finished
        );
        // Finishing again (or finishing an unknown job) is a no-op.
        assert!(!manager.mark_job_finished(job_id).await.unwrap());
        assert!(!manager.mark_job_finished(JobId::from_random()).await.unwrap());
    }
}
