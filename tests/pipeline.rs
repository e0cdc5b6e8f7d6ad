//! End-to-end runs of the orchestrator against in-process collaborators.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_test::assert_ok;

use subflow::admission::InMemoryAdmission;
use subflow::config::Config;
use subflow::error::{Result, SubflowError};
use subflow::event::{EventDetails, EventQuery, EventType};
use subflow::job::{Job, JobInput, JobOptions, JobStatus, Phase, StepStatus};
use subflow::media::{RenderResult, Renderer};
use subflow::notifier::{NotificationPayload, Notifier};
use subflow::orchestrator::{Collaborators, Orchestrator};
use subflow::runner::RetryPolicy;
use subflow::storage::{ObjectStorage, UploadResult};
use subflow::store::{JobStore, MemoryBackend};
use subflow::transcribe::{TranscriptSegment, Transcriber, TranscriptionResult};
use subflow::translate::{TokenUsage, TranslatedSegment, TranslationResult, Translator};

enum Behaviour {
    Succeed,
    AlwaysFail,
    Hang,
    /// Signal `started`, then block until `release` is notified.
    Gate { started: Arc<Notify>, release: Arc<Notify> },
}

struct FakeTranscriber {
    behaviour: Behaviour,
    calls: AtomicU32,
}

impl FakeTranscriber {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicU32::new(0),
        })
    }
}

fn transcript() -> TranscriptionResult {
    TranscriptionResult::from_segments(
        vec![
            TranscriptSegment {
                start: 0.0,
                end: 2.5,
                text: "Hello everyone".to_string(),
                confidence: 0.9,
            },
            TranscriptSegment {
                start: 2.5,
                end: 5.0,
                text: "Welcome to the talk".to_string(),
                confidence: 0.8,
            },
        ],
        "en".to_string(),
    )
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _media_path: PathBuf, _language_hint: Option<String>) -> Result<TranscriptionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Succeed => Ok(transcript()),
            Behaviour::AlwaysFail => Err(SubflowError::Transcription("model server returned 503".to_string())),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(transcript())
            }
            Behaviour::Gate { started, release } => {
                started.notify_one();
                release.notified().await;
                Ok(transcript())
            }
        }
    }
}

#[derive(Default)]
struct FakeTranslator {
    calls: AtomicU32,
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(
        &self,
        segments: Vec<TranscriptSegment>,
        target_language: String,
        _style: Option<String>,
    ) -> Result<TranslationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let translated_segments = segments
            .into_iter()
            .map(|s| TranslatedSegment {
                start: s.start,
                end: s.end,
                text: format!("[{}] {}", target_language, s.text),
                source_text: s.text,
            })
            .collect();
        Ok(TranslationResult {
            translated_segments,
            confidence: 0.75,
            token_usage: TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 40,
            },
        })
    }
}

#[derive(Default)]
struct FakeRenderer {
    calls: AtomicU32,
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, source: PathBuf, caption_track: PathBuf) -> Result<RenderResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(caption_track.exists(), "caption track should be written before rendering");
        Ok(RenderResult {
            output_ref: source.with_extension("subbed.mp4"),
            duration_secs: Some(5.0),
            resolution: Some("1280x720".to_string()),
        })
    }
}

#[derive(Default)]
struct FakeStorage {
    uploads: AtomicU32,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(&self, local_ref: PathBuf) -> Result<UploadResult> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let name = local_ref.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        Ok(UploadResult {
            url: format!("https://cdn.example.com/{}", name),
            size_bytes: 1024,
        })
    }

    async fn download(&self, remote_ref: String, dest_dir: PathBuf) -> Result<PathBuf> {
        Ok(dest_dir.join(remote_ref))
    }
}

struct FakeNotifier {
    fail: bool,
    payloads: std::sync::Mutex<Vec<NotificationPayload>>,
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, payload: NotificationPayload) -> Result<()> {
        self.payloads.lock().unwrap().push(payload);
        if self.fail {
            Err(SubflowError::Notification("webhook returned 500".to_string()))
        } else {
            Ok(())
        }
    }

    fn endpoint(&self) -> String {
        "https://hooks.example.com/jobs".to_string()
    }
}

struct Harness {
    orchestrator: Orchestrator,
    transcriber: Arc<FakeTranscriber>,
    translator: Arc<FakeTranslator>,
    renderer: Arc<FakeRenderer>,
    storage: Arc<FakeStorage>,
    admission: Arc<InMemoryAdmission>,
    _work: tempfile::TempDir,
}

fn harness(behaviour: Behaviour, notifier: Option<Arc<dyn Notifier>>) -> Harness {
    let work = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.work_dir = work.path().join("work");
    config.retry.transcribe = RetryPolicy::new(3, 10, 50).without_jitter();

    let transcriber = FakeTranscriber::new(behaviour);
    let translator = Arc::new(FakeTranslator::default());
    let renderer = Arc::new(FakeRenderer::default());
    let storage = Arc::new(FakeStorage::default());
    let admission = Arc::new(InMemoryAdmission::new(1, 4));

    let collaborators = Collaborators {
        transcriber: transcriber.clone(),
        translator: translator.clone(),
        renderer: renderer.clone(),
        storage: storage.clone(),
        admission: admission.clone(),
        notifier,
    };
    let store = Arc::new(JobStore::new(Arc::new(MemoryBackend::new()), Duration::from_secs(30)));

    Harness {
        orchestrator: Orchestrator::new(config, store, collaborators),
        transcriber,
        translator,
        renderer,
        storage,
        admission,
        _work: work,
    }
}

fn count(job: &Job, event_type: EventType) -> usize {
    job.events.iter().filter(|e| e.event_type == event_type).count()
}

fn entered(job: &Job, status: JobStatus) -> bool {
    job.events
        .iter()
        .any(|e| matches!(&e.details, EventDetails::StatusChanged { to, .. } if *to == status))
}

#[tokio::test]
async fn test_full_pipeline_succeeds() {
    let h = harness(Behaviour::Succeed, None);

    let receipt = assert_ok!(h.orchestrator.create_job(JobInput::new("talk.mp4", "ja")).await);
    assert_eq!(receipt.status, JobStatus::Queued);
    assert_eq!(receipt.job.events.len(), 1);
    assert_eq!(receipt.job.events[0].event_type, EventType::JobCreated);
    assert_eq!(receipt.job.progress.percentage, 0.0);

    let job = h.orchestrator.wait(&receipt.job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.phase, Phase::Done);
    assert_eq!(job.progress.percentage, 100.0);
    assert!(job.error.is_none());
    assert_eq!(job.metadata.source_language.as_deref(), Some("en"));
    assert!(job.metadata.processing_steps.iter().all(|s| s.status == StepStatus::Completed));

    let output = job.output.as_ref().unwrap();
    assert_eq!(output.source_language, "en");
    assert_eq!(output.target_language, "ja");
    assert_eq!(output.segments.len(), 2);
    assert_eq!(output.segments[0].text, "[ja] Hello everyone");
    assert!(output.caption_track.ends_with("talk.ja.srt"));
    assert!(PathBuf::from(&output.caption_track).exists());
    assert_eq!(output.rendered.as_ref().unwrap().resolution.as_deref(), Some("1280x720"));
    assert_eq!(output.published_url.as_deref(), Some("https://cdn.example.com/talk.subbed.mp4"));
    assert_eq!(output.stats.segment_count, 2);
    assert_eq!(output.stats.steps.len(), 4);
    assert_eq!(output.stats.prompt_tokens, 120);

    assert_eq!(count(&job, EventType::JobCreated), 1);
    assert_eq!(count(&job, EventType::JobCompleted), 1);
    assert_eq!(count(&job, EventType::StepCompleted), 4);

    let percentages: Vec<f64> = job
        .events
        .iter()
        .filter_map(|e| match &e.details {
            EventDetails::JobProgress { percentage, .. } => Some(*percentage),
            _ => None,
        })
        .collect();
    assert!(percentages.windows(2).all(|w| w[0] < w[1]));

    // The slot is free again and the store holds the final snapshot.
    assert_eq!(h.admission.active(), 0);
    let stored = h.orchestrator.store().get(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Done);
}

#[tokio::test]
async fn test_concurrent_jobs_for_one_source_admit_exactly_one() {
    let h = harness(Behaviour::Succeed, None);

    let (first, second) = tokio::join!(
        h.orchestrator.create_job(JobInput::new("talk.mp4", "ja")),
        h.orchestrator.create_job(JobInput::new("talk.mp4", "fr")),
    );

    let (admitted, rejected) = match (first, second) {
        (Ok(receipt), Err(error)) | (Err(error), Ok(receipt)) => (receipt, error),
        (Ok(_), Ok(_)) => panic!("both jobs were admitted"),
        (Err(a), Err(b)) => panic!("both jobs were rejected: {a} / {b}"),
    };
    assert!(matches!(rejected, SubflowError::Admission(_)));
    assert_eq!(h.orchestrator.list_jobs(None).await.len(), 1);

    h.orchestrator.wait(&admitted.job_id).await.unwrap();
    assert_ok!(h.orchestrator.create_job(JobInput::new("talk.mp4", "fr")).await);
}

#[tokio::test]
async fn test_exhausted_retries_fail_once_and_stop() {
    let h = harness(Behaviour::AlwaysFail, None);

    let receipt = h.orchestrator.create_job(JobInput::new("talk.mp4", "ja")).await.unwrap();
    let job = h.orchestrator.wait(&receipt.job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.phase, Phase::Transcribing);
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.translator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(job.metadata.retry_count, 2);

    let error = job.error.as_ref().unwrap();
    assert_eq!(error.code, "TRANSIENT_ERROR");
    assert_eq!(error.phase, Some(Phase::Transcribing));

    assert_eq!(count(&job, EventType::StepRetry), 2);
    assert_eq!(count(&job, EventType::StepFailed), 1);
    assert_eq!(count(&job, EventType::JobFailed), 1);
    assert!(!entered(&job, JobStatus::Translating));
    assert_eq!(job.events.last().unwrap().event_type, EventType::JobFailed);
    assert_eq!(h.admission.active(), 0);
}

#[tokio::test]
async fn test_cancel_stops_job_at_next_boundary() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness(
        Behaviour::Gate {
            started: started.clone(),
            release: release.clone(),
        },
        None,
    );

    let receipt = h.orchestrator.create_job(JobInput::new("talk.mp4", "ja")).await.unwrap();
    started.notified().await;

    let cancelled = assert_ok!(h.orchestrator.cancel_job(&receipt.job_id, "user request").await);
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    release.notify_one();
    let job = h.orchestrator.wait(&receipt.job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.phase, Phase::Transcribing);
    assert!(job.error.is_none());
    assert_eq!(h.translator.calls.load(Ordering::SeqCst), 0);
    assert!(!entered(&job, JobStatus::Translating));
    assert_eq!(count(&job, EventType::JobCancelled), 1);
    assert_eq!(count(&job, EventType::StepCompleted), 0);
    assert_eq!(job.step(Phase::Transcribing).unwrap().status, StepStatus::Failed);
    assert!(job.metadata.processing_steps.iter().all(|s| s.status != StepStatus::Running));
    assert_eq!(h.admission.active(), 0);

    let again = h.orchestrator.cancel_job(&receipt.job_id, "twice").await;
    assert!(matches!(again, Err(SubflowError::InvalidTransition { .. })));
}

#[tokio::test]
async fn test_deadline_fails_job_with_timeout() {
    let h = harness(Behaviour::Hang, None);
    let options = JobOptions {
        timeout_secs: Some(1),
        ..JobOptions::default()
    };

    let receipt = h
        .orchestrator
        .create_job(JobInput::new("talk.mp4", "ja").with_options(options))
        .await
        .unwrap();
    let job = h.orchestrator.wait(&receipt.job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.code, "TIMEOUT");
    assert_eq!(error.phase, Some(Phase::Transcribing));
    let step = job.step(Phase::Transcribing).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(count(&job, EventType::JobFailed), 1);
}

#[tokio::test]
async fn test_invalid_input_fails_from_queued() {
    let h = harness(Behaviour::Succeed, None);

    let receipt = h.orchestrator.create_job(JobInput::new("notes.txt", "ja")).await.unwrap();
    let job = h.orchestrator.wait(&receipt.job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.phase, Phase::Queued);
    assert_eq!(job.error.as_ref().unwrap().code, "VALIDATION_ERROR");
    assert_eq!(count(&job, EventType::ValidationFailed), 1);
    assert_eq!(count(&job, EventType::StatusChanged), 1);
    assert!(entered(&job, JobStatus::Failed));
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_disabled_phases_are_skipped() {
    let h = harness(Behaviour::Succeed, None);
    let options = JobOptions {
        render: false,
        upload: false,
        ..JobOptions::default()
    };

    let receipt = h
        .orchestrator
        .create_job(JobInput::new("talk.mp4", "de").with_options(options))
        .await
        .unwrap();
    let job = h.orchestrator.wait(&receipt.job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.metadata.processing_steps.len(), 2);
    assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.storage.uploads.load(Ordering::SeqCst), 0);

    let output = job.output.as_ref().unwrap();
    assert!(output.rendered.is_none());
    assert!(output.published_url.is_none());
    assert!(output.caption_track.ends_with("talk.de.srt"));

    let skipped = job
        .events
        .iter()
        .filter(|e| matches!(&e.details, EventDetails::StatusChanged { reason: Some(r), .. } if r == "skipped"))
        .count();
    assert_eq!(skipped, 2);
}

#[tokio::test]
async fn test_failed_notification_is_recorded_without_changing_status() {
    let notifier = Arc::new(FakeNotifier {
        fail: true,
        payloads: std::sync::Mutex::new(Vec::new()),
    });
    let h = harness(Behaviour::Succeed, Some(notifier.clone() as Arc<dyn Notifier>));

    let receipt = h.orchestrator.create_job(JobInput::new("talk.mp4", "ja")).await.unwrap();
    let job = h.orchestrator.wait(&receipt.job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Done);
    let record = job.metadata.notification.as_ref().unwrap();
    assert!(!record.notified);
    assert!(record.notify_error.as_ref().unwrap().contains("500"));
    assert_eq!(job.events.last().unwrap().event_type, EventType::NotificationFailed);

    let payloads = notifier.payloads.lock().unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].status, JobStatus::Done);
    assert!(payloads[0].output.is_some());
}

#[tokio::test]
async fn test_event_queries_paginate_newest_first() {
    let h = harness(Behaviour::Succeed, None);

    let receipt = h.orchestrator.create_job(JobInput::new("talk.mp4", "ja")).await.unwrap();
    let job = h.orchestrator.wait(&receipt.job_id).await.unwrap();

    let first = EventQuery {
        limit: 3,
        ..EventQuery::default()
    };
    let page = h.orchestrator.get_events(&job.id, &first).await.unwrap();
    assert_eq!(page.total, job.events.len());
    assert_eq!(page.events.len(), 3);
    assert!(page.has_more);
    assert_eq!(page.events[0].event_type, EventType::JobCompleted);

    let last = EventQuery {
        limit: 3,
        offset: job.events.len() - 1,
        ..EventQuery::default()
    };
    let page = h.orchestrator.get_events(&job.id, &last).await.unwrap();
    assert_eq!(page.events.len(), 1);
    assert!(!page.has_more);
    assert_eq!(page.events[0].event_type, EventType::JobCreated);

    let retries = EventQuery {
        event_type: Some(EventType::StepRetry),
        ..EventQuery::default()
    };
    assert_eq!(h.orchestrator.get_events(&job.id, &retries).await.unwrap().total, 0);

    let unknown = subflow::job::JobId::new();
    let page = assert_ok!(h.orchestrator.get_events(&unknown, &first).await);
    assert!(page.events.is_empty());
    assert_eq!(page.total, 0);
    assert!(!page.has_more);
}

#[tokio::test]
async fn test_sweep_removes_finished_jobs() {
    let h = harness(Behaviour::Succeed, None);

    let receipt = h.orchestrator.create_job(JobInput::new("talk.mp4", "ja")).await.unwrap();
    h.orchestrator.wait(&receipt.job_id).await.unwrap();

    assert!(h.orchestrator.sweep().await.is_empty());
    let swept = h.orchestrator.sweep_older_than(chrono::Duration::zero()).await;
    assert_eq!(swept, vec![receipt.job_id]);
    assert!(matches!(
        h.orchestrator.get_job(&receipt.job_id).await,
        Err(SubflowError::JobNotFound(_))
    ));
}
