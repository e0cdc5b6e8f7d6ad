use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, SubflowError};
use crate::job::{Job, JobId};
use super::JobBackend;

/// One pretty-printed JSON document per job under `<data_dir>/jobs/`.
pub struct FileBackend {
    jobs_dir: PathBuf,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            jobs_dir: data_dir.as_ref().join("jobs"),
        }
    }

    fn path_for(&self, id: &JobId) -> PathBuf {
        self.jobs_dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl JobBackend for FileBackend {
    async fn save(&self, job: &Job) -> Result<()> {
        tokio::fs::create_dir_all(&self.jobs_dir).await?;
        let content = serde_json::to_string_pretty(job)?;

        // Each write gets its own temp file so overlapping saves of one job
        // never rename each other's file away.
        let path = self.path_for(&job.id);
        let jobs_dir = self.jobs_dir.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&jobs_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.persist(&target).map_err(|e| SubflowError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| SubflowError::Internal(format!("job save task failed: {}", e)))??;

        debug!("Persisted job {} to {}", job.id, path.display());
        Ok(())
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>> {
        let path = self.path_for(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Job>> {
        if !tokio::fs::try_exists(&self.jobs_dir).await? {
            return Ok(Vec::new());
        }

        let paths: Vec<PathBuf> = WalkDir::new(&self.jobs_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();

        let mut jobs = Vec::with_capacity(paths.len());
        for path in paths {
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Job>(&content) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable job file {}: {}", path.display(), e),
            }
        }
        Ok(jobs)
    }

    async fn delete(&self, id: &JobId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.jobs_dir)
            .await
            .map_err(|e| SubflowError::Store(format!("{} is not writable: {}", self.jobs_dir.display(), e)))?;
        let probe = self.jobs_dir.join(".health");
        tokio::fs::write(&probe, b"ok")
            .await
            .map_err(|e| SubflowError::Store(format!("{} is not writable: {}", self.jobs_dir.display(), e)))?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }
}
