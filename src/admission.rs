//! Admission control: caps on active jobs per source key and overall.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Result, SubflowError};
use crate::job::JobId;

pub trait AdmissionControl: Send + Sync {
    /// Whether a new job for `source_key` would currently be admitted.
    fn is_allowed(&self, source_key: &str) -> bool;

    /// Check and register in one step. Rejects with [`SubflowError::Admission`].
    fn try_register(&self, job_id: JobId, source_key: &str) -> Result<()>;

    /// Forget `job_id`. Unknown ids are ignored.
    fn release(&self, job_id: &JobId);
}

#[derive(Debug, Default)]
struct Slots {
    by_job: HashMap<JobId, String>,
    per_source: HashMap<String, usize>,
}

impl Slots {
    fn insert(&mut self, job_id: JobId, source_key: &str) {
        if self.by_job.insert(job_id, source_key.to_string()).is_none() {
            *self.per_source.entry(source_key.to_string()).or_default() += 1;
        }
    }

    fn rejection(&self, source_key: &str, max_per_source: usize, max_global: usize) -> Option<String> {
        let active_for_source = self.per_source.get(source_key).copied().unwrap_or_default();
        if active_for_source >= max_per_source {
            return Some(format!(
                "source '{}' already has {} active job(s) (limit {})",
                source_key, active_for_source, max_per_source
            ));
        }
        if self.by_job.len() >= max_global {
            return Some(format!("{} active job(s) (global limit {})", self.by_job.len(), max_global));
        }
        None
    }
}

/// Limits held in process memory behind one mutex; check and register
/// happen under the same guard.
#[derive(Debug)]
pub struct InMemoryAdmission {
    max_per_source: usize,
    max_global: usize,
    slots: Mutex<Slots>,
}

impl InMemoryAdmission {
    pub fn new(max_per_source: usize, max_global: usize) -> Self {
        Self {
            max_per_source: max_per_source.max(1),
            max_global: max_global.max(1),
            slots: Mutex::new(Slots::default()),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Admission lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn active(&self) -> usize {
        self.slots().by_job.len()
    }
}

impl AdmissionControl for InMemoryAdmission {
    fn is_allowed(&self, source_key: &str) -> bool {
        self.slots()
            .rejection(source_key, self.max_per_source, self.max_global)
            .is_none()
    }

    fn try_register(&self, job_id: JobId, source_key: &str) -> Result<()> {
        let mut slots = self.slots();
        if let Some(reason) = slots.rejection(source_key, self.max_per_source, self.max_global) {
            warn!("Admission rejected for {}: {}", source_key, reason);
            return Err(SubflowError::Admission(reason));
        }
        slots.insert(job_id, source_key);
        debug!("Admitted job {} for {}", job_id, source_key);
        Ok(())
    }

    fn release(&self, job_id: &JobId) {
        let mut slots = self.slots();
        if let Some(source_key) = slots.by_job.remove(job_id) {
            if let Some(count) = slots.per_source.get_mut(&source_key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    slots.per_source.remove(&source_key);
                }
            }
            debug!("Released admission slot of job {}", job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_per_source_limit() {
        let admission = InMemoryAdmission::new(1, 10);
        let first = JobId::new();

        assert!(admission.try_register(first, "cam-1").is_ok());
        assert!(!admission.is_allowed("cam-1"));
        assert!(admission.is_allowed("cam-2"));
        assert!(matches!(
            admission.try_register(JobId::new(), "cam-1"),
            Err(SubflowError::Admission(_))
        ));

        admission.release(&first);
        admission.release(&first);
        assert!(admission.is_allowed("cam-1"));
        assert_eq!(admission.active(), 0);
    }

    #[test]
    fn test_global_limit() {
        let admission = InMemoryAdmission::new(5, 2);
        admission.try_register(JobId::new(), "a").unwrap();
        admission.try_register(JobId::new(), "b").unwrap();
        assert!(admission.try_register(JobId::new(), "c").is_err());
    }

    #[test]
    fn test_racing_registrations_admit_exactly_one() {
        let admission = Arc::new(InMemoryAdmission::new(1, 100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let admission = admission.clone();
                std::thread::spawn(move || admission.try_register(JobId::new(), "same-source").is_ok())
            })
            .collect();

        let admitted = handles.into_iter().filter_map(|h| h.join().ok()).filter(|ok| *ok).count();
        assert_eq!(admitted, 1);
    }
}
