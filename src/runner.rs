//! Phase runner: executes one pipeline step with bounded, backed-off retries.
//!
//! The per-job lock is only taken for the short bookkeeping sections; the
//! collaborator call and the backoff sleep run without it so status reads
//! are never blocked by a slow provider.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SubflowError};
use crate::event::{Event, EventDetails, EventLog};
use crate::job::{Job, Phase, StepProgress, StepStatus};
use crate::progress::ProgressEstimator;

/// Shared handle to a live job. Held briefly for mutations only.
pub type JobHandle = Arc<RwLock<Job>>;

/// Retry budget and backoff curve for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// Scale each delay by a random factor in [0.8, 1.2].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// `min(base * factor^(attempt-1), max)` before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.factor.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay to wait after failed `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let scale: f64 = rand::rng().random_range(0.8..=1.2);
        base.mul_f64(scale)
    }
}

/// Runs pipeline steps against collaborators and keeps step state, retry
/// counters, progress and events up to date.
#[derive(Debug, Clone)]
pub struct PhaseRunner {
    log: Arc<EventLog>,
    estimator: ProgressEstimator,
}

impl PhaseRunner {
    pub fn new(log: Arc<EventLog>, estimator: ProgressEstimator) -> Self {
        Self { log, estimator }
    }

    /// Recompute progress for `phase` and apply it without ever moving the
    /// percentage backwards. Emits `job_progress` when the value changes.
    pub fn report_progress(&self, job: &mut Job, phase: Phase, phase_progress: f64) {
        let estimate = self.estimator.estimate(job, phase, phase_progress, Utc::now());
        let previous = job.progress.percentage;

        job.progress.current_phase = phase;
        job.progress.phase_progress = estimate.phase_progress;
        job.progress.estimated_time_remaining_ms = estimate.estimated_time_remaining_ms;
        job.progress.message = phase.status_text().to_string();
        job.updated_at = Utc::now();

        if estimate.percentage > previous {
            job.progress.percentage = estimate.percentage;
            let details = EventDetails::JobProgress {
                percentage: job.progress.percentage,
                phase_progress: job.progress.phase_progress,
                estimated_time_remaining_ms: job.progress.estimated_time_remaining_ms,
                message: job.progress.message.clone(),
            };
            self.log.emit(job, details);
        }
    }

    /// Execute the step for `phase`, calling `operation(attempt)` until it
    /// succeeds, returns a non-retryable error, or the budget runs out.
    ///
    /// On final failure the step is marked `failed` and the error is
    /// returned; failing the job is left to the caller so it happens once.
    /// Returns [`SubflowError::Cancelled`] without touching the job if the
    /// job became terminal in the meantime.
    pub async fn run<T, F, Fut>(
        &self,
        handle: &JobHandle,
        phase: Phase,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            self.begin_attempt(handle, phase, attempt).await?;

            let result = operation(attempt).await;

            let mut job = handle.write().await;
            if job.is_terminal() {
                return Err(SubflowError::Cancelled);
            }
            let index = step_index(&job, phase)?;

            let error = match result {
                Ok(value) => {
                    self.finish_step(&mut job, index, phase);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let message = error.to_string();
            job.metadata.processing_steps[index].error = Some(message.clone());
            job.metadata.last_error = Some(message.clone());

            if !error.is_retryable() || attempt >= max_attempts {
                self.fail_step(&mut job, index, attempt, &message);
                return Err(error);
            }

            let delay = policy.delay_for(attempt);
            job.metadata.retry_count += 1;
            let retry_count = job.metadata.retry_count;
            let step = &job.metadata.processing_steps[index];
            warn!(
                "Job {}: {} attempt {}/{} failed: {} (retrying in {:?})",
                job.id, step.name, attempt, max_attempts, message, delay
            );
            let details = EventDetails::StepRetry {
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                attempt,
                max_attempts,
                delay_ms: delay.as_millis() as u64,
                error: message,
            };
            let event = self.tag_language(&job, phase, Event::new(&job, details).with_retry_count(retry_count));
            self.log.record(&mut job, event);
            drop(job);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    debug!("Backoff interrupted by cancellation");
                    return Err(SubflowError::Cancelled);
                }
            }

            attempt += 1;
        }
    }

    async fn begin_attempt(&self, handle: &JobHandle, phase: Phase, attempt: u32) -> Result<()> {
        let mut job = handle.write().await;
        if job.is_terminal() {
            return Err(SubflowError::Cancelled);
        }
        let index = step_index(&job, phase)?;

        let step = &mut job.metadata.processing_steps[index];
        if step.status == StepStatus::Completed {
            return Err(SubflowError::Internal(format!("Step {} already completed", step.name)));
        }
        step.status = StepStatus::Running;
        step.attempts = attempt;
        if step.start_time.is_none() {
            step.start_time = Some(Utc::now());
        }
        let progress = StepProgress {
            step_id: step.id.clone(),
            name: step.name.clone(),
            attempt,
        };

        if attempt == 1 {
            info!("Job {}: starting {}", job.id, progress.name);
            let details = EventDetails::StepStarted {
                step_id: progress.step_id.clone(),
                step_name: progress.name.clone(),
            };
            let event = self.tag_language(&job, phase, Event::new(&job, details));
            self.log.record(&mut job, event);
            self.report_progress(&mut job, phase, 0.0);
        }
        job.progress.step = Some(progress);
        Ok(())
    }

    fn finish_step(&self, job: &mut Job, index: usize, phase: Phase) {
        let now = Utc::now();
        let step = &mut job.metadata.processing_steps[index];
        let duration_ms = step
            .start_time
            .map(|start| (now - start).num_milliseconds().max(0) as u64)
            .unwrap_or_default();
        step.status = StepStatus::Completed;
        step.end_time = Some(now);
        step.actual_duration_ms = Some(duration_ms);
        step.error = None;

        info!("Job {}: {} completed in {} ms after {} attempt(s)", job.id, step.name, duration_ms, step.attempts);
        let details = EventDetails::StepCompleted {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            duration_ms,
            attempts: step.attempts,
        };
        let event = Event::new(job, details).with_processing_time(duration_ms);
        let event = self.tag_language(job, phase, event);
        self.log.record(job, event);

        job.progress.step = None;
        self.report_progress(job, phase, 100.0);
    }

    fn fail_step(&self, job: &mut Job, index: usize, attempts: u32, error: &str) {
        let now = Utc::now();
        let step = &mut job.metadata.processing_steps[index];
        step.status = StepStatus::Failed;
        step.end_time = Some(now);
        step.actual_duration_ms = step
            .start_time
            .map(|start| (now - start).num_milliseconds().max(0) as u64);

        warn!("Job {}: {} failed after {} attempt(s): {}", job.id, step.name, attempts, error);
        let details = EventDetails::StepFailed {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            attempts,
            error: error.to_string(),
        };
        let retry_count = job.metadata.retry_count;
        let event = Event::new(job, details).with_retry_count(retry_count);
        self.log.record(job, event);
    }

    /// Mark whatever step is running as failed; used when a deadline cuts
    /// the retry loop short.
    pub fn abort_running_step(&self, job: &mut Job, error: &str) {
        if let Some(index) = job
            .metadata
            .processing_steps
            .iter()
            .position(|step| step.status == StepStatus::Running)
        {
            let attempts = job.metadata.processing_steps[index].attempts;
            job.metadata.processing_steps[index].error = Some(error.to_string());
            self.fail_step(job, index, attempts, error);
        }
    }

    fn tag_language(&self, job: &Job, phase: Phase, event: Event) -> Event {
        match phase {
            Phase::Translating => event.with_language(job.input.target_language.clone()),
            _ => event,
        }
    }
}

fn step_index(job: &Job, phase: Phase) -> Result<usize> {
    job.step_index(phase)
        .ok_or_else(|| SubflowError::Internal(format!("Job {} has no {} step", job.id, phase)))
}
