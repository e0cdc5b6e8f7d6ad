//! Job state machine.
//!
//! All status changes go through [`StateMachine`]. The adjacency table in
//! [`allowed_transitions`] is the only place legal moves are defined;
//! cancellation is the one move outside the table and is accepted from any
//! non-terminal status.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::event::{Event, EventDetails, EventLog};
use crate::job::{Job, JobError, JobOutput, JobStatus, Phase, StepStatus};

/// Statuses reachable from `from` through the pipeline.
pub fn allowed_transitions(from: JobStatus) -> &'static [JobStatus] {
    match from {
        JobStatus::Queued => &[JobStatus::Transcribing, JobStatus::Failed],
        JobStatus::Transcribing => &[JobStatus::Translating, JobStatus::Failed],
        JobStatus::Translating => &[JobStatus::Rendering, JobStatus::Failed],
        JobStatus::Rendering => &[JobStatus::Uploading, JobStatus::Failed],
        JobStatus::Uploading => &[JobStatus::Done, JobStatus::Failed],
        JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled => &[],
    }
}

pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    if to == JobStatus::Cancelled {
        return !from.is_terminal();
    }
    allowed_transitions(from).contains(&to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Rejected,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

/// Owns status/phase mutation and the events that go with it.
#[derive(Debug, Clone)]
pub struct StateMachine {
    log: Arc<EventLog>,
}

impl StateMachine {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Move `job` to `to`. Illegal moves are logged and leave the job untouched.
    ///
    /// The phase follows the status while work is in flight; failed and
    /// cancelled jobs keep the phase they stopped in.
    pub fn transition(&self, job: &mut Job, to: JobStatus, reason: Option<&str>) -> TransitionOutcome {
        let from = job.status;
        if !can_transition(from, to) {
            warn!("Job {}: rejected transition {} -> {}", job.id, from, to);
            return TransitionOutcome::Rejected;
        }

        let now = Utc::now();
        job.status = to;
        if let Some(phase) = Phase::for_status(to) {
            job.phase = phase;
        }
        job.updated_at = now;

        if job.started_at.is_none() && from == JobStatus::Queued {
            job.started_at = Some(now);
        }

        if to.is_terminal() {
            job.completed_at = Some(now);
            let started = job.started_at.unwrap_or(job.created_at);
            job.metadata.actual_processing_time_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }

        info!("Job {}: {} -> {}{}", job.id, from, to, reason.map(|r| format!(" ({})", r)).unwrap_or_default());

        self.log.emit(
            job,
            EventDetails::StatusChanged {
                from,
                to,
                reason: reason.map(str::to_string),
            },
        );

        TransitionOutcome::Applied
    }

    /// Finish a job successfully. Only valid from `uploading`.
    pub fn complete(&self, job: &mut Job, output: JobOutput) -> TransitionOutcome {
        let outcome = self.transition(job, JobStatus::Done, None);
        if !outcome.is_applied() {
            return outcome;
        }

        job.progress.percentage = 100.0;
        job.progress.current_phase = Phase::Done;
        job.progress.phase_progress = 100.0;
        job.progress.estimated_time_remaining_ms = 0;
        job.progress.message = Phase::Done.status_text().to_string();
        job.progress.step = None;

        let processing_time_ms = job.metadata.actual_processing_time_ms.unwrap_or_default();
        let published_url = output.published_url.clone();
        job.output = Some(output);

        let event = Event::new(
            job,
            EventDetails::JobCompleted {
                published_url,
                processing_time_ms,
            },
        )
        .with_processing_time(processing_time_ms)
        .with_language(job.input.target_language.clone());
        self.log.record(job, event);

        outcome
    }

    /// Fail a job. Irreversible; a second call is a rejected no-op.
    pub fn fail(&self, job: &mut Job, error: JobError) -> TransitionOutcome {
        let outcome = self.transition(job, JobStatus::Failed, Some(error.code.as_str()));
        if !outcome.is_applied() {
            return outcome;
        }

        job.progress.message = format!("Failed during {}: {}", job.phase, error.message);
        job.progress.step = None;
        job.metadata.last_error = Some(error.message.clone());

        let details = EventDetails::JobFailed {
            code: error.code.clone(),
            message: error.message.clone(),
            phase: error.phase,
            diagnostic: error.diagnostic.clone(),
        };
        job.error = Some(error);

        let retry_count = job.metadata.retry_count;
        let event = Event::new(job, details).with_retry_count(retry_count);
        self.log.record(job, event);

        outcome
    }

    /// Cancel a job from any non-terminal status.
    pub fn cancel(&self, job: &mut Job, reason: &str) -> TransitionOutcome {
        let outcome = self.transition(job, JobStatus::Cancelled, Some(reason));
        if !outcome.is_applied() {
            return outcome;
        }

        job.progress.message = format!("Cancelled during {}", job.phase);
        job.progress.step = None;

        // The in-flight step never finishes; close it out with the job.
        let now = job.completed_at.unwrap_or_else(Utc::now);
        if let Some(step) = job.running_step_mut() {
            step.status = StepStatus::Failed;
            step.end_time = Some(now);
            step.actual_duration_ms = step
                .start_time
                .map(|start| (now - start).num_milliseconds().max(0) as u64);
            step.error = Some(format!("cancelled: {}", reason));
        }

        let phase = job.phase;
        self.log.emit(
            job,
            EventDetails::JobCancelled {
                reason: reason.to_string(),
                phase,
            },
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventQuery, EventType, Severity};
    use crate::job::{ErrorKind, JobInput, ProcessingStats, ProcessingStep};

    fn setup() -> (StateMachine, Job) {
        let steps = Phase::PIPELINE
            .iter()
            .map(|phase| ProcessingStep::new(*phase, 1_000))
            .collect();
        let job = Job::new(JobInput::new("clip.mp4", "ja"), steps, None);
        (StateMachine::new(Arc::new(EventLog::new())), job)
    }

    fn status_events(machine: &StateMachine, job: &Job) -> usize {
        let query = EventQuery {
            event_type: Some(EventType::StatusChanged),
            ..EventQuery::default()
        };
        machine.log().query(&job.id, &query).total
    }

    fn output() -> JobOutput {
        JobOutput {
            source_language: "en".into(),
            target_language: "ja".into(),
            segments: Vec::new(),
            caption_track: "clip.ja.srt".into(),
            rendered: None,
            published_url: Some("file:///tmp/clip.ja.mp4".into()),
            stats: ProcessingStats::default(),
        }
    }

    fn walk_to_uploading(machine: &StateMachine, job: &mut Job) {
        for phase in Phase::PIPELINE {
            assert!(machine.transition(job, phase.status(), None).is_applied());
        }
    }

    #[test]
    fn test_table_matches_pipeline() {
        assert!(can_transition(JobStatus::Queued, JobStatus::Transcribing));
        assert!(can_transition(JobStatus::Uploading, JobStatus::Done));
        assert!(can_transition(JobStatus::Rendering, JobStatus::Failed));
        assert!(!can_transition(JobStatus::Queued, JobStatus::Done));
        assert!(!can_transition(JobStatus::Translating, JobStatus::Transcribing));
        assert!(can_transition(JobStatus::Rendering, JobStatus::Cancelled));
        for terminal in [JobStatus::Done, JobStatus::Failed, JobStatus::Cancelled] {
            for to in JobStatus::ALL {
                assert!(!can_transition(terminal, to));
            }
        }
    }

    #[test]
    fn test_rejected_transition_leaves_job_unchanged() {
        let (machine, mut job) = setup();
        let before = job.clone();

        let outcome = machine.transition(&mut job, JobStatus::Done, None);

        assert_eq!(outcome, TransitionOutcome::Rejected);
        assert_eq!(job, before);
        assert_eq!(status_events(&machine, &job), 0);
    }

    #[test]
    fn test_first_transition_sets_started_at() {
        let (machine, mut job) = setup();
        machine.transition(&mut job, JobStatus::Transcribing, None);

        assert_eq!(job.phase, Phase::Transcribing);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());
        assert_eq!(job.events.last().unwrap().metadata.severity, Severity::Info);
    }

    #[test]
    fn test_complete_sets_terminal_fields() {
        let (machine, mut job) = setup();
        walk_to_uploading(&machine, &mut job);

        assert!(machine.complete(&mut job, output()).is_applied());

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.phase, Phase::Done);
        assert_eq!(job.progress.percentage, 100.0);
        assert!(job.completed_at.is_some());
        assert!(job.metadata.actual_processing_time_ms.is_some());
        assert_eq!(job.events.last().unwrap().event_type, EventType::JobCompleted);
        let done_change = &job.events[job.events.len() - 2];
        assert_eq!(done_change.metadata.severity, Severity::Success);
    }

    #[test]
    fn test_fail_is_irreversible_and_single() {
        let (machine, mut job) = setup();
        machine.transition(&mut job, JobStatus::Transcribing, None);

        let error = JobError {
            code: ErrorKind::Transient.code().to_string(),
            message: "provider down".to_string(),
            kind: ErrorKind::Transient,
            phase: Some(Phase::Transcribing),
            diagnostic: None,
        };
        assert!(machine.fail(&mut job, error.clone()).is_applied());
        assert!(!machine.fail(&mut job, error).is_applied());
        assert!(!machine.transition(&mut job, JobStatus::Translating, None).is_applied());

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.phase, Phase::Transcribing);
        let failed = job.events.iter().filter(|e| e.event_type == EventType::JobFailed).count();
        assert_eq!(failed, 1);
    }

    #[test]
    fn test_cancel_from_any_in_flight_status() {
        let (machine, mut job) = setup();
        machine.transition(&mut job, JobStatus::Transcribing, None);
        machine.transition(&mut job, JobStatus::Translating, None);

        assert!(machine.cancel(&mut job, "user request").is_applied());
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.phase, Phase::Translating);
        assert!(!machine.cancel(&mut job, "again").is_applied());
        assert_eq!(job.events.last().unwrap().event_type, EventType::JobCancelled);
    }

    #[test]
    fn test_cancel_closes_running_step() {
        let (machine, mut job) = setup();
        machine.transition(&mut job, JobStatus::Transcribing, None);
        {
            let step = &mut job.metadata.processing_steps[0];
            step.status = StepStatus::Running;
            step.attempts = 1;
            step.start_time = Some(Utc::now());
        }

        machine.cancel(&mut job, "shutdown");

        let step = job.step(Phase::Transcribing).unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.end_time.is_some());
        assert_eq!(step.error.as_deref(), Some("cancelled: shutdown"));
        assert_eq!(job.step(Phase::Translating).unwrap().status, StepStatus::Pending);
    }
}
