//! Append-only job event history.
//!
//! Every transition, retry and notification is recorded twice: on the job
//! record itself (so a persisted job carries its own history) and in the
//! [`EventLog`], which shards events per job and answers filtered,
//! paginated, newest-first queries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SubflowError};
use crate::job::{Job, JobId, JobStatus, Phase};

/// Largest page a query may request.
pub const MAX_QUERY_LIMIT: usize = 100;
pub const DEFAULT_QUERY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobCreated,
    StatusChanged,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCancelled,
    ValidationStarted,
    ValidationCompleted,
    ValidationFailed,
    StepStarted,
    StepRetry,
    StepCompleted,
    StepFailed,
    NotificationSent,
    NotificationFailed,
}

impl EventType {
    pub const ALL: [EventType; 15] = [
        EventType::JobCreated,
        EventType::StatusChanged,
        EventType::JobProgress,
        EventType::JobCompleted,
        EventType::JobFailed,
        EventType::JobCancelled,
        EventType::ValidationStarted,
        EventType::ValidationCompleted,
        EventType::ValidationFailed,
        EventType::StepStarted,
        EventType::StepRetry,
        EventType::StepCompleted,
        EventType::StepFailed,
        EventType::NotificationSent,
        EventType::NotificationFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobCreated => "job_created",
            EventType::StatusChanged => "status_changed",
            EventType::JobProgress => "job_progress",
            EventType::JobCompleted => "job_completed",
            EventType::JobFailed => "job_failed",
            EventType::JobCancelled => "job_cancelled",
            EventType::ValidationStarted => "validation_started",
            EventType::ValidationCompleted => "validation_completed",
            EventType::ValidationFailed => "validation_failed",
            EventType::StepStarted => "step_started",
            EventType::StepRetry => "step_retry",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::NotificationSent => "notification_sent",
            EventType::NotificationFailed => "notification_failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = SubflowError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| SubflowError::Config(format!("Unknown event type '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl FromStr for Severity {
    type Err = SubflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "success" => Ok(Severity::Success),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            other => Err(SubflowError::Config(format!("Unknown severity '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Lifecycle,
    Validation,
    Processing,
    Progress,
    Notification,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Lifecycle => "lifecycle",
            Category::Validation => "validation",
            Category::Processing => "processing",
            Category::Progress => "progress",
            Category::Notification => "notification",
        }
    }
}

impl FromStr for Category {
    type Err = SubflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "lifecycle" => Ok(Category::Lifecycle),
            "validation" => Ok(Category::Validation),
            "processing" => Ok(Category::Processing),
            "progress" => Ok(Category::Progress),
            "notification" => Ok(Category::Notification),
            other => Err(SubflowError::Config(format!("Unknown category '{}'", other))),
        }
    }
}

/// Typed payload of an event, keyed by event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDetails {
    JobCreated {
        source_ref: String,
        target_language: String,
        pipeline: Vec<Phase>,
    },
    StatusChanged {
        from: JobStatus,
        to: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    JobProgress {
        percentage: f64,
        phase_progress: f64,
        estimated_time_remaining_ms: u64,
        message: String,
    },
    JobCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        published_url: Option<String>,
        processing_time_ms: u64,
    },
    JobFailed {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<Phase>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostic: Option<String>,
    },
    JobCancelled {
        reason: String,
        phase: Phase,
    },
    ValidationStarted {
        source_ref: String,
    },
    ValidationCompleted {
        checks: Vec<String>,
    },
    ValidationFailed {
        code: String,
        message: String,
    },
    StepStarted {
        step_id: String,
        step_name: String,
    },
    StepRetry {
        step_id: String,
        step_name: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error: String,
    },
    StepCompleted {
        step_id: String,
        step_name: String,
        duration_ms: u64,
        attempts: u32,
    },
    StepFailed {
        step_id: String,
        step_name: String,
        attempts: u32,
        error: String,
    },
    NotificationSent {
        endpoint: String,
    },
    NotificationFailed {
        endpoint: String,
        error: String,
    },
}

impl EventDetails {
    pub fn event_type(&self) -> EventType {
        match self {
            EventDetails::JobCreated { .. } => EventType::JobCreated,
            EventDetails::StatusChanged { .. } => EventType::StatusChanged,
            EventDetails::JobProgress { .. } => EventType::JobProgress,
            EventDetails::JobCompleted { .. } => EventType::JobCompleted,
            EventDetails::JobFailed { .. } => EventType::JobFailed,
            EventDetails::JobCancelled { .. } => EventType::JobCancelled,
            EventDetails::ValidationStarted { .. } => EventType::ValidationStarted,
            EventDetails::ValidationCompleted { .. } => EventType::ValidationCompleted,
            EventDetails::ValidationFailed { .. } => EventType::ValidationFailed,
            EventDetails::StepStarted { .. } => EventType::StepStarted,
            EventDetails::StepRetry { .. } => EventType::StepRetry,
            EventDetails::StepCompleted { .. } => EventType::StepCompleted,
            EventDetails::StepFailed { .. } => EventType::StepFailed,
            EventDetails::NotificationSent { .. } => EventType::NotificationSent,
            EventDetails::NotificationFailed { .. } => EventType::NotificationFailed,
        }
    }

    fn default_severity(&self) -> Severity {
        match self {
            EventDetails::StatusChanged { to, .. } => match to {
                JobStatus::Failed => Severity::Error,
                JobStatus::Done => Severity::Success,
                _ => Severity::Info,
            },
            EventDetails::JobCompleted { .. }
            | EventDetails::ValidationCompleted { .. }
            | EventDetails::StepCompleted { .. } => Severity::Success,
            EventDetails::JobFailed { .. }
            | EventDetails::ValidationFailed { .. }
            | EventDetails::StepFailed { .. } => Severity::Error,
            EventDetails::JobCancelled { .. }
            | EventDetails::StepRetry { .. }
            | EventDetails::NotificationFailed { .. } => Severity::Warning,
            _ => Severity::Info,
        }
    }

    fn default_category(&self) -> Category {
        match self {
            EventDetails::JobCreated { .. }
            | EventDetails::StatusChanged { .. }
            | EventDetails::JobCompleted { .. }
            | EventDetails::JobFailed { .. }
            | EventDetails::JobCancelled { .. } => Category::Lifecycle,
            EventDetails::JobProgress { .. } => Category::Progress,
            EventDetails::ValidationStarted { .. }
            | EventDetails::ValidationCompleted { .. }
            | EventDetails::ValidationFailed { .. } => Category::Validation,
            EventDetails::StepStarted { .. }
            | EventDetails::StepRetry { .. }
            | EventDetails::StepCompleted { .. }
            | EventDetails::StepFailed { .. } => Category::Processing,
            EventDetails::NotificationSent { .. } | EventDetails::NotificationFailed { .. } => {
                Category::Notification
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub severity: Severity,
    pub category: Category,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

/// Immutable record of something that happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    /// Position in the job's history, assigned on append.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub status: JobStatus,
    pub phase: Phase,
    pub details: EventDetails,
    pub metadata: EventMetadata,
}

impl Event {
    /// Build an event stamped with the job's current status and phase.
    pub fn new(job: &Job, details: EventDetails) -> Self {
        let category = details.default_category();
        let metadata = EventMetadata {
            severity: details.default_severity(),
            category,
            tags: vec![category.as_str().to_string(), job.phase.as_str().to_string()],
            language: None,
            retry_count: None,
            processing_time_ms: None,
        };

        Self {
            event_id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            event_type: details.event_type(),
            status: job.status,
            phase: job.phase,
            details,
            metadata,
        }
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        let tag = tag.into();
        if !self.metadata.tags.contains(&tag) {
            self.metadata.tags.push(tag);
        }
        self
    }

    pub fn with_language<S: Into<String>>(mut self, language: S) -> Self {
        self.metadata.language = Some(language.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.metadata.retry_count = Some(retry_count);
        self
    }

    pub fn with_processing_time(mut self, processing_time_ms: u64) -> Self {
        self.metadata.processing_time_ms = Some(processing_time_ms);
        self
    }
}

/// Filters for [`EventLog::query`]. All filters are conjunctive; `tags`
/// matches when the event carries any one of them.
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    pub event_type: Option<EventType>,
    pub severity: Option<Severity>,
    pub category: Option<Category>,
    pub language: Option<String>,
    pub phase: Option<Phase>,
    pub tags: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            event_type: None,
            severity: None,
            category: None,
            language: None,
            phase: None,
            tags: Vec::new(),
            since: None,
            until: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

impl EventQuery {
    pub fn matches(&self, event: &Event) -> bool {
        if self.event_type.is_some_and(|t| t != event.event_type) {
            return false;
        }
        if self.severity.is_some_and(|s| s != event.metadata.severity) {
            return false;
        }
        if self.category.is_some_and(|c| c != event.metadata.category) {
            return false;
        }
        if self.phase.is_some_and(|p| p != event.phase) {
            return false;
        }
        if let Some(language) = &self.language {
            if event.metadata.language.as_deref() != Some(language.as_str()) {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| event.metadata.tags.contains(t)) {
            return false;
        }
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp > until) {
            return false;
        }
        true
    }

    /// Filter, order newest-first and paginate a job's history.
    pub fn apply(&self, events: &[Event]) -> EventPage {
        let limit = self.limit.clamp(1, MAX_QUERY_LIMIT);
        let matching: Vec<&Event> = events.iter().rev().filter(|e| self.matches(e)).collect();
        let total = matching.len();

        let page: Vec<Event> = matching
            .into_iter()
            .skip(self.offset)
            .take(limit)
            .cloned()
            .collect();
        let has_more = self.offset + page.len() < total;

        EventPage {
            events: page,
            total,
            has_more,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Number of events matching the filters, before pagination.
    pub total: usize,
    pub has_more: bool,
}

impl EventPage {
    pub fn empty() -> Self {
        Self {
            events: Vec::new(),
            total: 0,
            has_more: false,
        }
    }
}

/// Per-job event shards. Appends to different jobs never contend on the
/// same lock unless they land in the same map shard.
#[derive(Debug, Default)]
pub struct EventLog {
    shards: DashMap<JobId, Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to a job's history and return it as stored.
    ///
    /// Assigns the next sequence number and never lets a timestamp go
    /// backwards relative to the previous event of the same job.
    pub fn append(&self, job_id: JobId, mut event: Event) -> Event {
        let mut shard = self.shards.entry(job_id).or_default();
        if let Some(last) = shard.last() {
            event.sequence = last.sequence + 1;
            if event.timestamp < last.timestamp {
                event.timestamp = last.timestamp;
            }
        } else {
            event.sequence = 0;
        }
        shard.push(event.clone());
        event
    }

    /// Append to the log and mirror onto the job record.
    pub fn record(&self, job: &mut Job, event: Event) -> Event {
        let stored = self.append(job.id, event);
        job.events.push(stored.clone());
        stored
    }

    /// Build an event for the job's current state and record it.
    pub fn emit(&self, job: &mut Job, details: EventDetails) -> Event {
        let event = Event::new(job, details);
        self.record(job, event)
    }

    pub fn query(&self, job_id: &JobId, query: &EventQuery) -> EventPage {
        match self.shards.get(job_id) {
            Some(events) => query.apply(&events),
            None => EventPage::empty(),
        }
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.shards.contains_key(job_id)
    }

    pub fn len(&self, job_id: &JobId) -> usize {
        self.shards.get(job_id).map(|events| events.len()).unwrap_or(0)
    }

    pub fn remove(&self, job_id: &JobId) -> Option<Vec<Event>> {
        self.shards.remove(job_id).map(|(_, events)| events)
    }
}
