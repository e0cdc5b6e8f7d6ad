use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::job::{Job, JobId};
use super::JobBackend;

/// Process-local backend, for tests and `backend = "memory"`.
#[derive(Default)]
pub struct MemoryBackend {
    jobs: DashMap<JobId, Job>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobBackend for MemoryBackend {
    async fn save(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(id).map(|job| job.clone()))
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn delete(&self, id: &JobId) -> Result<()> {
        self.jobs.remove(id);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
