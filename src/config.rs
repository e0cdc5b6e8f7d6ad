use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{Result, SubflowError};
use crate::job::Phase;
use crate::progress::PhaseWeights;
use crate::runner::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryConfig,
    pub progress: ProgressConfig,
    pub store: StoreConfig,
    pub notifier: NotifierConfig,
    pub transcriber: TranscriberConfig,
    pub translate: TranslateConfig,
    pub media: MediaConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deadline applied to jobs that do not set their own
    pub default_timeout_secs: u64,
    /// Maximum number of active jobs across all sources
    pub max_concurrent_jobs: usize,
    /// Maximum number of active jobs sharing one source key
    pub max_jobs_per_source: usize,
    /// Terminal jobs older than this are removed by the sweeper
    pub retention_hours: u64,
    /// How often the sweeper runs
    pub sweep_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30 * 60,
            max_concurrent_jobs: 4,
            max_jobs_per_source: 1,
            retention_hours: 72,
            sweep_interval_secs: 10 * 60,
        }
    }
}

/// Retry policy per phase. Provider characteristics differ, so each
/// collaborator gets its own budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub transcribe: RetryPolicy,
    pub translate: RetryPolicy,
    pub render: RetryPolicy,
    pub upload: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transcribe: RetryPolicy::new(3, 2_000, 30_000),
            translate: RetryPolicy::new(4, 1_000, 40_000),
            render: RetryPolicy::new(2, 3_000, 30_000),
            upload: RetryPolicy::new(3, 1_000, 30_000),
        }
    }
}

impl RetryConfig {
    pub fn policy_for(&self, phase: Phase) -> &RetryPolicy {
        match phase {
            Phase::Translating => &self.translate,
            Phase::Rendering => &self.render,
            Phase::Uploading => &self.upload,
            _ => &self.transcribe,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Position of each phase on the 0-100 scale
    pub weights: PhaseWeights,
    /// Expected duration of each step, used for time-remaining estimates
    pub estimated_durations: PhaseDurations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseDurations {
    pub transcribe_secs: u64,
    pub translate_secs: u64,
    pub render_secs: u64,
    pub upload_secs: u64,
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            transcribe_secs: 60,
            translate_secs: 30,
            render_secs: 45,
            upload_secs: 15,
        }
    }
}

impl PhaseDurations {
    pub fn estimate_ms(&self, phase: Phase) -> u64 {
        let secs = match phase {
            Phase::Transcribing => self.transcribe_secs,
            Phase::Translating => self.translate_secs,
            Phase::Rendering => self.render_secs,
            Phase::Uploading => self.upload_secs,
            Phase::Queued | Phase::Done => 0,
        };
        secs * 1_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// One JSON document per job under `data_dir`
    File,
    /// Process memory only
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    /// Directory holding persisted jobs
    pub data_dir: PathBuf,
    /// How long a backend health check result is trusted
    pub health_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::File,
            data_dir: PathBuf::from(".subflow/data"),
            health_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Endpoint receiving terminal-state payloads; disabled when unset
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Path to transcriber binary (e.g., whisper-cli)
    pub binary_path: String,
    /// Path to the ggml model file
    pub model_path: PathBuf,
    /// Language used when the job carries no hint ("auto" to detect)
    pub default_language: String,
    /// Number of worker threads passed to the transcriber
    pub threads: u32,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            binary_path: "whisper-cli".to_string(),
            model_path: PathBuf::from(".subflow/models/ggml-base.bin"),
            default_language: "auto".to_string(),
            threads: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateConfig {
    /// Ollama endpoint URL
    pub endpoint: String,
    /// LLM model to use for translation
    pub model: String,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Number of preceding segments passed as context
    pub context_window: usize,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_secs: 300,
            context_window: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Path to ffmpeg binary
    pub binary_path: String,
    /// Path to ffprobe binary, used to report output duration and resolution
    pub probe_path: String,
    /// Additional encoding options for subtitle embedding
    /// Common options: ["-preset", "medium", "-crf", "23", "-pix_fmt", "yuv420p"]
    pub subtitle_options: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            probe_path: "ffprobe".to_string(),
            subtitle_options: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Scratch directory for downloaded sources and intermediate files
    pub work_dir: PathBuf,
    /// Directory that published artifacts are copied into
    pub publish_dir: PathBuf,
    /// Public URL prefix for published artifacts; file:// URLs when unset
    pub public_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".subflow/work"),
            publish_dir: PathBuf::from(".subflow/published"),
            public_base_url: None,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SubflowError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| SubflowError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SubflowError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| SubflowError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Job deadline, falling back to the orchestrator default.
    pub fn timeout_for(&self, timeout_secs: Option<u64>) -> chrono::Duration {
        chrono::Duration::seconds(timeout_secs.unwrap_or(self.orchestrator.default_timeout_secs) as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.orchestrator.retention_hours as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [orchestrator]
            max_jobs_per_source = 2

            [retry.translate]
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.max_jobs_per_source, 2);
        assert_eq!(config.orchestrator.max_concurrent_jobs, 4);
        assert_eq!(config.retry.translate.max_attempts, 2);
        assert_eq!(config.retry.translate.factor, 2.0);
        assert_eq!(config.retry.render.max_attempts, 2);
        assert_eq!(config.progress.weights.rendering, 75.0);
        assert_eq!(config.store.backend, StoreBackendKind::File);
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("subflow.toml");

        let mut config = Config::default();
        config.notifier.webhook_url = Some("https://hooks.example.com/jobs".to_string());
        config.save_to_file(file.path()).unwrap();
        assert!(std::fs::read_to_string(file.path()).unwrap().contains("webhook_url"));

        let loaded = Config::from_file(file.path()).unwrap();
        assert_eq!(loaded.notifier.webhook_url, config.notifier.webhook_url);
        assert_eq!(loaded.retry.upload, config.retry.upload);
    }

    #[test]
    fn test_policy_for_phase() {
        let config = Config::default();
        assert_eq!(config.retry.policy_for(Phase::Translating).max_attempts, 4);
        assert_eq!(config.retry.policy_for(Phase::Rendering).base_delay_ms, 3_000);
        assert_eq!(config.progress.estimated_durations.estimate_ms(Phase::Uploading), 15_000);
    }
}
