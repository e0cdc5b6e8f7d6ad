//! Job data model: identifiers, statuses, phases, steps and the job record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SubflowError};
use crate::event::Event;
use crate::media::RenderResult;
use crate::translate::TranslatedSegment;

/// Opaque, globally unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = SubflowError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| SubflowError::Validation(format!("Invalid job id '{}': {}", s, e)))
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Transcribing,
    Translating,
    Rendering,
    Uploading,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Queued,
        JobStatus::Transcribing,
        JobStatus::Translating,
        JobStatus::Rendering,
        JobStatus::Uploading,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Transcribing => "transcribing",
            JobStatus::Translating => "translating",
            JobStatus::Rendering => "rendering",
            JobStatus::Uploading => "uploading",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SubflowError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| SubflowError::Config(format!("Unknown job status '{}'", s)))
    }
}

/// Pipeline phase. Mirrors the in-flight statuses and ends at `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Transcribing,
    Translating,
    Rendering,
    Uploading,
    Done,
}

impl Phase {
    /// Phases that do work, in execution order.
    pub const PIPELINE: [Phase; 4] = [
        Phase::Transcribing,
        Phase::Translating,
        Phase::Rendering,
        Phase::Uploading,
    ];

    /// Phase a job sits in while it has the given status. Failed and
    /// cancelled jobs keep whatever phase they were in.
    pub fn for_status(status: JobStatus) -> Option<Phase> {
        match status {
            JobStatus::Queued => Some(Phase::Queued),
            JobStatus::Transcribing => Some(Phase::Transcribing),
            JobStatus::Translating => Some(Phase::Translating),
            JobStatus::Rendering => Some(Phase::Rendering),
            JobStatus::Uploading => Some(Phase::Uploading),
            JobStatus::Done => Some(Phase::Done),
            JobStatus::Failed | JobStatus::Cancelled => None,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Phase::Queued => JobStatus::Queued,
            Phase::Transcribing => JobStatus::Transcribing,
            Phase::Translating => JobStatus::Translating,
            Phase::Rendering => JobStatus::Rendering,
            Phase::Uploading => JobStatus::Uploading,
            Phase::Done => JobStatus::Done,
        }
    }

    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Queued => Some(Phase::Transcribing),
            Phase::Transcribing => Some(Phase::Translating),
            Phase::Translating => Some(Phase::Rendering),
            Phase::Rendering => Some(Phase::Uploading),
            Phase::Uploading => Some(Phase::Done),
            Phase::Done => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Transcribing => "transcribing",
            Phase::Translating => "translating",
            Phase::Rendering => "rendering",
            Phase::Uploading => "uploading",
            Phase::Done => "done",
        }
    }

    /// Short step name used for processing steps and log lines.
    pub fn step_name(&self) -> &'static str {
        match self {
            Phase::Queued => "queue",
            Phase::Transcribing => "transcribe",
            Phase::Translating => "translate",
            Phase::Rendering => "render",
            Phase::Uploading => "upload",
            Phase::Done => "done",
        }
    }

    /// User-facing status text for `progress.message`.
    pub fn status_text(&self) -> &'static str {
        match self {
            Phase::Queued => "Waiting to start",
            Phase::Transcribing => "Transcribing audio",
            Phase::Translating => "Translating captions",
            Phase::Rendering => "Rendering subtitled video",
            Phase::Uploading => "Publishing result",
            Phase::Done => "Completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = SubflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Ok(Phase::Queued),
            "transcribing" | "transcribe" => Ok(Phase::Transcribing),
            "translating" | "translate" => Ok(Phase::Translating),
            "rendering" | "render" => Ok(Phase::Rendering),
            "uploading" | "upload" => Ok(Phase::Uploading),
            "done" => Ok(Phase::Done),
            other => Err(SubflowError::Config(format!("Unknown phase '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One phase of the pipeline as tracked on the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStep {
    pub id: String,
    pub name: String,
    pub phase: Phase,
    pub estimated_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_duration_ms: Option<u64>,
    pub status: StepStatus,
    /// Attempts made so far, including the one in flight.
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessingStep {
    pub fn new(phase: Phase, estimated_duration_ms: u64) -> Self {
        Self {
            id: format!("step-{}", Uuid::new_v4().simple()),
            name: phase.step_name().to_string(),
            phase,
            estimated_duration_ms,
            actual_duration_ms: None,
            status: StepStatus::Pending,
            attempts: 0,
            start_time: None,
            end_time: None,
            error: None,
        }
    }
}

/// Step-level detail attached to the progress snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProgress {
    pub step_id: String,
    pub name: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Overall completion, 0 to 100.
    pub percentage: f64,
    pub current_phase: Phase,
    /// Completion within the current phase band, 0 to 100.
    pub phase_progress: f64,
    pub estimated_time_remaining_ms: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<StepProgress>,
}

impl JobProgress {
    pub fn initial(total_estimated_ms: u64) -> Self {
        Self {
            percentage: 0.0,
            current_phase: Phase::Queued,
            phase_progress: 0.0,
            estimated_time_remaining_ms: total_estimated_ms,
            message: Phase::Queued.status_text().to_string(),
            step: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Caller-supplied options. Opaque to the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Burn captions into the video. When false the caption track is the artifact.
    #[serde(default = "default_true")]
    pub render: bool,
    /// Publish the artifact through object storage.
    #[serde(default = "default_true")]
    pub upload: bool,
    /// Free-form translation style hint (e.g. "formal").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Source language hint for transcription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    /// Admission key; defaults to the source reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    /// Per-job deadline override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            render: true,
            upload: true,
            style: None,
            source_language: None,
            source_key: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub source_ref: String,
    pub target_language: String,
    #[serde(default)]
    pub options: JobOptions,
}

impl JobInput {
    pub fn new<S: Into<String>, L: Into<String>>(source_ref: S, target_language: L) -> Self {
        Self {
            source_ref: source_ref.into(),
            target_language: target_language.into(),
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Key used by admission control.
    pub fn source_key(&self) -> &str {
        self.options.source_key.as_deref().unwrap_or(&self.source_ref)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub name: String,
    pub duration_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_duration_ms: u64,
    pub steps: Vec<StepTiming>,
    pub retry_count: u32,
    pub segment_count: usize,
    pub transcription_confidence: f32,
    pub translation_confidence: f32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Result of a successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub source_language: String,
    pub target_language: String,
    #[serde(default)]
    pub segments: Vec<TranslatedSegment>,
    pub caption_track: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<RenderResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_url: Option<String>,
    pub stats: ProcessingStats,
}

/// Failure taxonomy shared by the runner and the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transient,
    Fatal,
    Timeout,
    /// Not a failure; used to unwind a job task after an external cancel.
    Cancelled,
}

impl ErrorKind {
    /// Stable machine code exposed on `Job::error`.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Transient => "TRANSIENT_ERROR",
            ErrorKind::Fatal => "FATAL_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Full diagnostic (debug rendering and backtrace when captured).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl JobError {
    pub fn from_error(error: &SubflowError, phase: Option<Phase>) -> Self {
        let kind = error.kind();
        let diagnostic = match kind {
            ErrorKind::Fatal => {
                let backtrace = std::backtrace::Backtrace::capture();
                Some(format!("{:?}\n{}", error, backtrace))
            }
            _ => None,
        };

        Self {
            code: kind.code().to_string(),
            message: error.to_string(),
            kind,
            phase,
            diagnostic,
        }
    }
}

/// Outcome of the terminal-state webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub notified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub processing_languages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    pub processing_steps: Vec<ProcessingStep>,
    pub total_estimated_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_processing_time_ms: Option<u64>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationRecord>,
}

/// One unit of work tracked from creation to a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub phase: Phase,
    pub progress: JobProgress,
    pub input: JobInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub metadata: JobMetadata,
    #[serde(default)]
    pub events: Vec<Event>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a queued job. `steps` fixes the pipeline for the job's lifetime.
    pub fn new(input: JobInput, steps: Vec<ProcessingStep>, timeout: Option<chrono::Duration>) -> Self {
        let now = Utc::now();
        let total_estimated_time_ms = steps.iter().map(|s| s.estimated_duration_ms).sum();

        let mut processing_languages = Vec::new();
        if let Some(source) = &input.options.source_language {
            processing_languages.push(source.clone());
        }
        processing_languages.push(input.target_language.clone());

        Self {
            id: JobId::new(),
            status: JobStatus::Queued,
            phase: Phase::Queued,
            progress: JobProgress::initial(total_estimated_time_ms),
            metadata: JobMetadata {
                processing_languages,
                source_language: input.options.source_language.clone(),
                processing_steps: steps,
                total_estimated_time_ms,
                actual_processing_time_ms: None,
                retry_count: 0,
                last_error: None,
                notification: None,
            },
            input,
            output: None,
            error: None,
            events: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            timeout_at: timeout.map(|t| now + t),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step_index(&self, phase: Phase) -> Option<usize> {
        self.metadata
            .processing_steps
            .iter()
            .position(|step| step.phase == phase)
    }

    pub fn step(&self, phase: Phase) -> Option<&ProcessingStep> {
        self.metadata.processing_steps.iter().find(|step| step.phase == phase)
    }

    /// The step currently running, if any.
    pub fn running_step_mut(&mut self) -> Option<&mut ProcessingStep> {
        self.metadata
            .processing_steps
            .iter_mut()
            .find(|step| step.status == StepStatus::Running)
    }

    /// Wall-clock duration from creation to completion (or now).
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let end = self.completed_at.unwrap_or(now);
        (end - self.created_at).num_milliseconds().max(0) as u64
    }
}
