//! Job store with a durable backend and an in-memory cache.
//!
//! The cache always holds the latest snapshot written through this store.
//! The backend is consulted only while its cached health check says it is
//! available; failures are logged and the store keeps serving from memory.

pub mod file;
pub mod memory;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::config::{StoreBackendKind, StoreConfig};
use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};

pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Durable persistence for job records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn save(&self, job: &Job) -> Result<()>;
    async fn load(&self, id: &JobId) -> Result<Option<Job>>;
    async fn list(&self) -> Result<Vec<Job>>;
    async fn delete(&self, id: &JobId) -> Result<()>;
    async fn health_check(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Health {
    available: bool,
    checked_at: Option<Instant>,
}

/// Cache-first job store.
pub struct JobStore {
    backend: Arc<dyn JobBackend>,
    cache: DashMap<JobId, Job>,
    health: Mutex<Health>,
    health_ttl: Duration,
}

impl JobStore {
    pub fn new(backend: Arc<dyn JobBackend>, health_ttl: Duration) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
            health: Mutex::new(Health {
                available: true,
                checked_at: None,
            }),
            health_ttl,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        let backend: Arc<dyn JobBackend> = match config.backend {
            StoreBackendKind::File => Arc::new(FileBackend::new(&config.data_dir)),
            StoreBackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        Self::new(backend, Duration::from_secs(config.health_ttl_secs))
    }

    fn health(&self) -> Health {
        match self.health.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => {
                warn!("Job store health lock was poisoned, recovering");
                *poisoned.into_inner()
            }
        }
    }

    fn set_health(&self, available: bool) {
        let mut guard = match self.health.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Job store health lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        if guard.available && !available {
            warn!("Job store backend unavailable; continuing in memory-only mode");
        } else if !guard.available && available {
            info!("Job store backend available again");
        }
        guard.available = available;
        guard.checked_at = Some(Instant::now());
    }

    /// True while the last health check (or backend call) failed.
    pub fn is_degraded(&self) -> bool {
        !self.health().available
    }

    /// Whether the backend should be used, re-checking once the cached
    /// result is older than the TTL.
    pub async fn is_available(&self) -> bool {
        let health = self.health();
        let fresh = health
            .checked_at
            .is_some_and(|at| at.elapsed() < self.health_ttl);
        if fresh {
            return health.available;
        }

        let available = match self.backend.health_check().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Job store health check failed: {}", e);
                false
            }
        };
        self.set_health(available);
        available
    }

    fn backend_failed(&self, operation: &str, id: Option<&JobId>, e: impl std::fmt::Display) {
        match id {
            Some(id) => error!("Job store {} failed for job {}: {}", operation, id, e),
            None => error!("Job store {} failed: {}", operation, e),
        }
        self.set_health(false);
    }

    /// Record a snapshot. Never fails; backend errors degrade the store.
    pub async fn save(&self, job: &Job) {
        self.cache.insert(job.id, job.clone());

        if !self.is_available().await {
            return;
        }
        if let Err(e) = self.backend.save(job).await {
            self.backend_failed("save", Some(&job.id), e);
        }
    }

    /// Durable copy first, refreshing the cache; the cached snapshot is
    /// used while the backend is degraded or has no record.
    pub async fn get(&self, id: &JobId) -> Option<Job> {
        if self.is_available().await {
            match self.backend.load(id).await {
                Ok(Some(job)) => {
                    self.cache.insert(job.id, job.clone());
                    return Some(job);
                }
                Ok(None) => {}
                Err(e) => self.backend_failed("load", Some(id), e),
            }
        }
        self.cache.get(id).map(|job| job.clone())
    }

    /// Jobs matching `status` (all when `None`), newest first. Cached
    /// snapshots win over backend copies of the same job.
    pub async fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = Vec::new();

        if self.is_available().await {
            match self.backend.list().await {
                Ok(stored) => jobs.extend(stored.into_iter().filter(|job| !self.cache.contains_key(&job.id))),
                Err(e) => self.backend_failed("list", None, e),
            }
        }
        jobs.extend(self.cache.iter().map(|entry| entry.value().clone()));

        jobs.retain(|job| status.is_none_or(|status| job.status == status));
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub async fn list_by_status(&self, status: JobStatus) -> Vec<Job> {
        self.list(Some(status)).await
    }

    pub async fn delete(&self, id: &JobId) {
        self.cache.remove(id);
        if !self.is_available().await {
            return;
        }
        if let Err(e) = self.backend.delete(id).await {
            self.backend_failed("delete", Some(id), e);
        }
    }

    /// Remove terminal jobs completed before `now - retention`.
    pub async fn sweep(&self, retention: chrono::Duration, now: DateTime<Utc>) -> Vec<JobId> {
        let cutoff = now - retention;
        let expired: Vec<JobId> = self
            .list(None)
            .await
            .into_iter()
            .filter(|job| job.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
            .map(|job| job.id)
            .collect();

        for id in &expired {
            self.delete(id).await;
        }
        if !expired.is_empty() {
            info!("Swept {} expired job(s)", expired.len());
        }
        expired
    }
}
