//! Orchestrator: owns the job registry and drives each job through its
//! pipeline on a dedicated task.
//!
//! Per job there is exactly one writer task. Status reads, event queries and
//! cancellation run concurrently with it and only ever take the per-job lock
//! for short critical sections.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionControl, InMemoryAdmission};
use crate::config::Config;
use crate::error::{Result, SubflowError};
use crate::event::{Event, EventDetails, EventLog, EventPage, EventQuery};
use crate::job::{
    Job, JobError, JobId, JobInput, JobOptions, JobOutput, JobStatus, NotificationRecord, Phase,
    ProcessingStats, ProcessingStep, StepStatus, StepTiming,
};
use crate::media::{RenderResult, Renderer, RendererFactory};
use crate::notifier::{NotificationPayload, Notifier, WebhookNotifier};
use crate::progress::ProgressEstimator;
use crate::runner::{JobHandle, PhaseRunner};
use crate::state::StateMachine;
use crate::storage::{LocalObjectStorage, ObjectStorage};
use crate::store::JobStore;
use crate::subtitle::generate_srt;
use crate::transcribe::{TranscriberFactory, Transcriber, TranscriptionResult};
use crate::translate::{TranslationResult, Translator, TranslatorFactory};
use crate::validate::validate_input;

/// External services a job depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub translator: Arc<dyn Translator>,
    pub renderer: Arc<dyn Renderer>,
    pub storage: Arc<dyn ObjectStorage>,
    pub admission: Arc<dyn AdmissionControl>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Collaborators {
    /// Production collaborators: whisper.cpp, Ollama, ffmpeg, local storage.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transcriber: Arc<dyn Transcriber> = Arc::from(TranscriberFactory::create_default(
            config.transcriber.clone(),
            config.media.clone(),
        ));
        let translator: Arc<dyn Translator> = Arc::from(TranslatorFactory::create_default(config.translate.clone())?);
        let renderer: Arc<dyn Renderer> = Arc::from(RendererFactory::create_renderer(config.media.clone()));
        let notifier = WebhookNotifier::from_config(&config.notifier)?.map(|n| Arc::new(n) as Arc<dyn Notifier>);

        Ok(Self {
            transcriber,
            translator,
            renderer,
            storage: Arc::new(LocalObjectStorage::new(config.storage.clone())),
            admission: Arc::new(InMemoryAdmission::new(
                config.orchestrator.max_jobs_per_source,
                config.orchestrator.max_concurrent_jobs,
            )),
            notifier,
        })
    }
}

/// Returned by [`Orchestrator::create_job`].
#[derive(Debug, Clone)]
pub struct JobReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Snapshot taken before the job task started.
    pub job: Job,
}

struct JobEntry {
    handle: JobHandle,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

/// Flags the job as finished even if its task unwinds.
struct DoneOnDrop<'a>(&'a watch::Sender<bool>);

impl Drop for DoneOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// Artifacts handed from one phase to the next.
#[derive(Debug, Default)]
struct PipelineContext {
    source_path: Option<PathBuf>,
    transcript: Option<TranscriptionResult>,
    translation: Option<TranslationResult>,
    caption_track: Option<PathBuf>,
    rendered: Option<RenderResult>,
    published_url: Option<String>,
}

struct Inner {
    config: Config,
    registry: DashMap<JobId, Arc<JobEntry>>,
    log: Arc<EventLog>,
    store: Arc<JobStore>,
    machine: StateMachine,
    runner: PhaseRunner,
    collaborators: Collaborators,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: Config, store: Arc<JobStore>, collaborators: Collaborators) -> Self {
        let log = Arc::new(EventLog::new());
        let estimator = ProgressEstimator::new(config.progress.weights.clone());
        Self {
            inner: Arc::new(Inner {
                machine: StateMachine::new(log.clone()),
                runner: PhaseRunner::new(log.clone(), estimator),
                registry: DashMap::new(),
                log,
                store,
                collaborators,
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let store = Arc::new(JobStore::from_config(&config.store));
        let collaborators = Collaborators::from_config(&config)?;
        Ok(Self::new(config, store, collaborators))
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Admit, record and start a job.
    ///
    /// Admission is checked and registered before anything else happens; a
    /// rejected job is never stored, never emits events and never reaches
    /// `queued`.
    pub async fn create_job(&self, input: JobInput) -> Result<JobReceipt> {
        let inner = &self.inner;
        let steps = pipeline(&input.options)
            .into_iter()
            .map(|phase| ProcessingStep::new(phase, inner.config.progress.estimated_durations.estimate_ms(phase)))
            .collect();
        let timeout = inner.config.timeout_for(input.options.timeout_secs);
        let mut job = Job::new(input, steps, Some(timeout));

        inner.collaborators.admission.try_register(job.id, job.input.source_key())?;

        let details = EventDetails::JobCreated {
            source_ref: job.input.source_ref.clone(),
            target_language: job.input.target_language.clone(),
            pipeline: job.metadata.processing_steps.iter().map(|s| s.phase).collect(),
        };
        let event = Event::new(&job, details).with_language(job.input.target_language.clone());
        inner.log.record(&mut job, event);
        info!(
            "Job {} created: {} -> {} ({} steps)",
            job.id,
            job.input.source_ref,
            job.input.target_language,
            job.metadata.processing_steps.len()
        );

        let receipt = JobReceipt {
            job_id: job.id,
            status: job.status,
            job: job.clone(),
        };

        let (done, _) = watch::channel(false);
        let entry = Arc::new(JobEntry {
            handle: Arc::new(tokio::sync::RwLock::new(job)),
            cancel: inner.shutdown.child_token(),
            done,
        });
        inner.registry.insert(receipt.job_id, entry.clone());
        inner.store.save(&receipt.job).await;

        tokio::spawn(inner.clone().drive(entry));
        Ok(receipt)
    }

    /// Full snapshot of a live or stored job.
    pub async fn get_job(&self, id: &JobId) -> Result<Job> {
        if let Some(entry) = self.entry(id) {
            return Ok(entry.handle.read().await.clone());
        }
        self.inner
            .store
            .get(id)
            .await
            .ok_or_else(|| SubflowError::JobNotFound(id.to_string()))
    }

    /// Query a job's events. Falls back to the stored history once the
    /// in-memory shard is gone; an unknown job has an empty history.
    pub async fn get_events(&self, id: &JobId, query: &EventQuery) -> Result<EventPage> {
        if self.inner.log.contains(id) {
            return Ok(self.inner.log.query(id, query));
        }
        match self.inner.store.get(id).await {
            Some(job) => Ok(query.apply(&job.events)),
            None => {
                debug!("No events for unknown job {}", id);
                Ok(EventPage::empty())
            }
        }
    }

    /// Cancel a non-terminal job. The job task notices at its next phase
    /// boundary or backoff sleep and stops without further side effects.
    pub async fn cancel_job(&self, id: &JobId, reason: &str) -> Result<Job> {
        let inner = &self.inner;
        let Some(entry) = self.entry(id) else {
            let mut job = inner
                .store
                .get(id)
                .await
                .ok_or_else(|| SubflowError::JobNotFound(id.to_string()))?;
            if job.is_terminal() {
                return Err(SubflowError::InvalidTransition {
                    from: job.status,
                    to: JobStatus::Cancelled,
                });
            }
            // Left behind by a previous process; nothing is running it.
            inner.machine.cancel(&mut job, reason);
            inner.store.save(&job).await;
            return Ok(job);
        };

        let snapshot = {
            let mut job = entry.handle.write().await;
            if job.is_terminal() {
                return Err(SubflowError::InvalidTransition {
                    from: job.status,
                    to: JobStatus::Cancelled,
                });
            }
            inner.machine.cancel(&mut job, reason);
            job.clone()
        };
        entry.cancel.cancel();
        inner.store.save(&snapshot).await;
        Ok(snapshot)
    }

    /// Wait for a job's task to finish and return the final snapshot.
    pub async fn wait(&self, id: &JobId) -> Result<Job> {
        let Some(entry) = self.entry(id) else {
            return self.get_job(id).await;
        };
        let mut done = entry.done.subscribe();
        if done.wait_for(|finished| *finished).await.is_err() {
            debug!("Job {} finished signal dropped", id);
        }
        Ok(entry.handle.read().await.clone())
    }

    /// Live and stored jobs, newest first.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs = self.inner.store.list(None).await;
        let live: Vec<Arc<JobEntry>> = self.inner.registry.iter().map(|e| e.value().clone()).collect();
        for entry in live {
            let snapshot = entry.handle.read().await.clone();
            match jobs.iter_mut().find(|job| job.id == snapshot.id) {
                Some(job) => *job = snapshot,
                None => jobs.push(snapshot),
            }
        }
        jobs.retain(|job| status.is_none_or(|status| job.status == status));
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Drop terminal jobs older than the retention window from the store,
    /// the registry and the event log.
    pub async fn sweep(&self) -> Vec<JobId> {
        self.sweep_older_than(self.inner.config.retention()).await
    }

    pub async fn sweep_older_than(&self, retention: chrono::Duration) -> Vec<JobId> {
        let inner = &self.inner;
        let swept = inner.store.sweep(retention, Utc::now()).await;
        for id in &swept {
            inner.registry.remove(id);
            inner.log.remove(id);
        }
        swept
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval_secs` until shutdown.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let period = Duration::from_secs(self.inner.config.orchestrator.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let swept = orchestrator.sweep().await;
                        debug!("Sweeper removed {} job(s)", swept.len());
                    }
                    _ = orchestrator.inner.shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Stop the sweeper and signal every running job to stop.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn entry(&self, id: &JobId) -> Option<Arc<JobEntry>> {
        self.inner.registry.get(id).map(|e| e.value().clone())
    }
}

/// Enabled phases for `options`, in execution order.
pub fn pipeline(options: &JobOptions) -> Vec<Phase> {
    Phase::PIPELINE
        .into_iter()
        .filter(|phase| match phase {
            Phase::Rendering => options.render,
            Phase::Uploading => options.upload,
            _ => true,
        })
        .collect()
}

impl Inner {
    async fn drive(self: Arc<Self>, entry: Arc<JobEntry>) {
        let _done = DoneOnDrop(&entry.done);
        let (job_id, timeout_at) = {
            let job = entry.handle.read().await;
            (job.id, job.timeout_at)
        };

        let outcome = match timeout_at {
            Some(deadline) => {
                let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                match tokio::time::timeout(remaining, self.execute(&entry)).await {
                    Ok(result) => result,
                    Err(_) => Err(SubflowError::Timeout(format!("job exceeded its deadline of {}", deadline))),
                }
            }
            None => self.execute(&entry).await,
        };

        {
            let mut job = entry.handle.write().await;
            match outcome {
                Ok(output) if !job.is_terminal() => {
                    self.machine.complete(&mut job, output);
                    info!("Job {} done in {} ms", job_id, job.elapsed_ms(Utc::now()));
                }
                Ok(_) => {}
                Err(_) if job.is_terminal() => {
                    debug!("Job {} stopped after reaching {}", job_id, job.status);
                }
                Err(SubflowError::Cancelled) => {
                    self.machine.cancel(&mut job, "shutdown");
                }
                Err(error) => {
                    if matches!(error, SubflowError::Timeout(_)) {
                        self.runner.abort_running_step(&mut job, &error.to_string());
                    }
                    let phase = job.phase;
                    self.machine.fail(&mut job, JobError::from_error(&error, Some(phase)));
                }
            }
        }

        self.finalize(&entry).await;
    }

    async fn execute(&self, entry: &JobEntry) -> Result<JobOutput> {
        self.validate(entry).await?;

        let (job_id, input) = {
            let job = entry.handle.read().await;
            (job.id, job.input.clone())
        };
        let work_dir = self.config.storage.work_dir.join(job_id.to_string());
        let mut ctx = PipelineContext::default();

        self.enter(entry, Phase::Transcribing, None).await?;
        let (source_path, transcript) = self.transcribe(entry, &input, &work_dir).await?;
        ctx.source_path = Some(source_path);
        self.checkpoint(entry).await;

        self.enter(entry, Phase::Translating, None).await?;
        let (translation, caption_track) = self.translate(entry, &input, &transcript, &work_dir).await?;
        ctx.transcript = Some(transcript);
        ctx.translation = Some(translation);
        ctx.caption_track = Some(caption_track);
        self.checkpoint(entry).await;

        if input.options.render {
            self.enter(entry, Phase::Rendering, None).await?;
            ctx.rendered = Some(self.render(entry, &ctx).await?);
            self.checkpoint(entry).await;
        } else {
            self.skip(entry, Phase::Rendering).await?;
        }

        let artifact = match (&ctx.rendered, &ctx.caption_track) {
            (Some(rendered), _) => rendered.output_ref.clone(),
            (None, Some(caption_track)) => caption_track.clone(),
            (None, None) => return Err(SubflowError::Internal("no artifact to publish".to_string())),
        };
        if input.options.upload {
            self.enter(entry, Phase::Uploading, None).await?;
            ctx.published_url = Some(self.upload(entry, artifact).await?);
            self.checkpoint(entry).await;
        } else {
            self.skip(entry, Phase::Uploading).await?;
        }

        if entry.cancel.is_cancelled() {
            return Err(SubflowError::Cancelled);
        }
        let job = entry.handle.read().await;
        Ok(assemble_output(&job, ctx))
    }

    async fn validate(&self, entry: &JobEntry) -> Result<()> {
        let mut job = entry.handle.write().await;
        if job.is_terminal() {
            return Err(SubflowError::Cancelled);
        }

        let source_ref = job.input.source_ref.clone();
        self.log.emit(&mut job, EventDetails::ValidationStarted { source_ref });

        match validate_input(&job.input) {
            Ok(checks) => {
                debug!("Job {} passed validation: {:?}", job.id, checks);
                self.log.emit(&mut job, EventDetails::ValidationCompleted { checks });
                Ok(())
            }
            Err(error) => {
                warn!("Job {} failed validation: {}", job.id, error);
                let details = EventDetails::ValidationFailed {
                    code: error.kind().code().to_string(),
                    message: error.to_string(),
                };
                self.log.emit(&mut job, details);
                Err(error)
            }
        }
    }

    /// Phase boundary: stop if cancelled, otherwise move to `phase`.
    async fn enter(&self, entry: &JobEntry, phase: Phase, reason: Option<&str>) -> Result<()> {
        if entry.cancel.is_cancelled() {
            return Err(SubflowError::Cancelled);
        }
        let mut job = entry.handle.write().await;
        if job.is_terminal() {
            return Err(SubflowError::Cancelled);
        }
        if !self.machine.transition(&mut job, phase.status(), reason).is_applied() {
            return Err(SubflowError::InvalidTransition {
                from: job.status,
                to: phase.status(),
            });
        }
        Ok(())
    }

    /// Pass through a disabled phase without running a step.
    async fn skip(&self, entry: &JobEntry, phase: Phase) -> Result<()> {
        self.enter(entry, phase, Some("skipped")).await?;
        let mut job = entry.handle.write().await;
        self.runner.report_progress(&mut job, phase, 100.0);
        Ok(())
    }

    async fn checkpoint(&self, entry: &JobEntry) {
        let snapshot = entry.handle.read().await.clone();
        self.store.save(&snapshot).await;
    }

    async fn transcribe(
        &self,
        entry: &JobEntry,
        input: &JobInput,
        work_dir: &Path,
    ) -> Result<(PathBuf, TranscriptionResult)> {
        let policy = self.config.retry.policy_for(Phase::Transcribing);
        let storage = &self.collaborators.storage;
        let transcriber = &self.collaborators.transcriber;

        let (source_path, transcript) = self
            .runner
            .run(&entry.handle, Phase::Transcribing, policy, &entry.cancel, |_attempt| {
                let source_ref = input.source_ref.clone();
                let hint = input.options.source_language.clone();
                let work_dir = work_dir.to_path_buf();
                async move {
                    let local = storage.download(source_ref, work_dir).await?;
                    let transcript = transcriber.transcribe(local.clone(), hint).await?;
                    if transcript.segments.is_empty() {
                        return Err(SubflowError::Validation("no speech detected in source".to_string()));
                    }
                    Ok((local, transcript))
                }
            })
            .await?;

        let mut job = entry.handle.write().await;
        job.metadata.source_language = Some(transcript.language_detected.clone());
        if !job.metadata.processing_languages.contains(&transcript.language_detected) {
            job.metadata.processing_languages.insert(0, transcript.language_detected.clone());
        }
        Ok((source_path, transcript))
    }

    async fn translate(
        &self,
        entry: &JobEntry,
        input: &JobInput,
        transcript: &TranscriptionResult,
        work_dir: &Path,
    ) -> Result<(TranslationResult, PathBuf)> {
        let policy = self.config.retry.policy_for(Phase::Translating);
        let translator = &self.collaborators.translator;
        let caption_track = work_dir.join(caption_file_name(&input.source_ref, &input.target_language));

        let translation = self
            .runner
            .run(&entry.handle, Phase::Translating, policy, &entry.cancel, |_attempt| {
                let segments = transcript.segments.clone();
                let target = input.target_language.clone();
                let style = input.options.style.clone();
                let caption_track = caption_track.clone();
                async move {
                    let translation = translator.translate(segments, target, style).await?;
                    generate_srt(&translation.translated_segments, &caption_track).await?;
                    Ok(translation)
                }
            })
            .await?;
        Ok((translation, caption_track))
    }

    async fn render(&self, entry: &JobEntry, ctx: &PipelineContext) -> Result<RenderResult> {
        let (Some(source), Some(caption_track)) = (&ctx.source_path, &ctx.caption_track) else {
            return Err(SubflowError::Internal("render needs a source and a caption track".to_string()));
        };
        let policy = self.config.retry.policy_for(Phase::Rendering);
        let renderer = &self.collaborators.renderer;

        self.runner
            .run(&entry.handle, Phase::Rendering, policy, &entry.cancel, |_attempt| {
                renderer.render(source.clone(), caption_track.clone())
            })
            .await
    }

    async fn upload(&self, entry: &JobEntry, artifact: PathBuf) -> Result<String> {
        let policy = self.config.retry.policy_for(Phase::Uploading);
        let storage = &self.collaborators.storage;

        let uploaded = self
            .runner
            .run(&entry.handle, Phase::Uploading, policy, &entry.cancel, |_attempt| {
                storage.upload(artifact.clone())
            })
            .await?;
        Ok(uploaded.url)
    }

    /// Release admission, notify, persist. Runs once per job, after the
    /// terminal transition.
    async fn finalize(&self, entry: &JobEntry) {
        let job_id = entry.handle.read().await.id;
        self.collaborators.admission.release(&job_id);

        if let Some(notifier) = &self.collaborators.notifier {
            let payload = NotificationPayload::from_job(&*entry.handle.read().await);
            let result = notifier.notify(payload).await;
            let endpoint = notifier.endpoint();

            let mut job = entry.handle.write().await;
            let details = match &result {
                Ok(()) => {
                    info!("Job {}: notified {}", job_id, endpoint);
                    EventDetails::NotificationSent { endpoint }
                }
                Err(e) => {
                    warn!("Job {}: notification to {} failed: {}", job_id, endpoint, e);
                    EventDetails::NotificationFailed {
                        endpoint,
                        error: e.to_string(),
                    }
                }
            };
            job.metadata.notification = Some(NotificationRecord {
                notified: result.is_ok(),
                notify_error: result.err().map(|e| e.to_string()),
                attempted_at: Utc::now(),
            });
            self.log.emit(&mut job, details);
        }

        let snapshot = entry.handle.read().await.clone();
        self.store.save(&snapshot).await;
    }
}

/// `<source-stem>.<lang>.srt`
fn caption_file_name(source_ref: &str, target_language: &str) -> String {
    let path = source_ref.split(['?', '#']).next().unwrap_or(source_ref);
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "captions".to_string());
    format!("{}.{}.srt", stem, target_language)
}

fn assemble_output(job: &Job, ctx: PipelineContext) -> JobOutput {
    let steps = job
        .metadata
        .processing_steps
        .iter()
        .filter(|step| step.status == StepStatus::Completed)
        .map(|step| StepTiming {
            name: step.name.clone(),
            duration_ms: step.actual_duration_ms.unwrap_or_default(),
            attempts: step.attempts,
        })
        .collect();

    let (source_language, segment_count, transcription_confidence) = match &ctx.transcript {
        Some(t) => (t.language_detected.clone(), t.segments.len(), t.confidence),
        None => (String::new(), 0, 0.0),
    };
    let (segments, translation_confidence, usage) = match ctx.translation {
        Some(t) => (t.translated_segments, t.confidence, t.token_usage),
        None => (Vec::new(), 0.0, Default::default()),
    };

    JobOutput {
        source_language,
        target_language: job.input.target_language.clone(),
        segments,
        caption_track: ctx
            .caption_track
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        rendered: ctx.rendered,
        published_url: ctx.published_url,
        stats: ProcessingStats {
            total_duration_ms: job.elapsed_ms(Utc::now()),
            steps,
            retry_count: job.metadata.retry_count,
            segment_count,
            transcription_confidence,
            translation_confidence,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_follows_options() {
        assert_eq!(pipeline(&JobOptions::default()), Phase::PIPELINE.to_vec());

        let captions_only = JobOptions {
            render: false,
            upload: false,
            ..JobOptions::default()
        };
        assert_eq!(pipeline(&captions_only), vec![Phase::Transcribing, Phase::Translating]);
    }

    #[test]
    fn test_caption_file_name() {
        assert_eq!(caption_file_name("/media/talk.mp4", "ja"), "talk.ja.srt");
        assert_eq!(caption_file_name("https://cdn.example.com/a/b.mov?sig=1", "pt-BR"), "b.pt-BR.srt");
    }
}
