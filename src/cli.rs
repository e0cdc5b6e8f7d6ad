use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::event::{Category, EventType, Severity};
use crate::job::{JobId, JobStatus, Phase};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one media file through the subtitle pipeline
    Process {
        /// Input media file or URL
        #[arg(short, long)]
        input: String,

        /// Target language code (e.g. ja, pt-BR)
        #[arg(short, long, default_value = "ja")]
        target_lang: String,

        /// Source language hint; detected when omitted
        #[arg(short, long)]
        source_lang: Option<String>,

        /// Only produce the caption track, do not burn it into the video
        #[arg(long)]
        no_render: bool,

        /// Keep the result local instead of publishing it
        #[arg(long)]
        no_upload: bool,

        /// Translation style hint (e.g. formal, casual)
        #[arg(long)]
        style: Option<String>,

        /// Job deadline in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Show a stored job
    Status {
        job_id: JobId,
    },

    /// Query a stored job's events
    Events {
        job_id: JobId,

        #[arg(long = "type")]
        event_type: Option<EventType>,

        #[arg(long)]
        severity: Option<Severity>,

        #[arg(long)]
        category: Option<Category>,

        #[arg(long)]
        phase: Option<Phase>,

        /// Match events carrying any of these tags
        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// List stored jobs
    List {
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Delete finished jobs older than the retention window
    Sweep {
        /// Override the configured retention, in days
        #[arg(short, long)]
        days: Option<u64>,
    },

    /// Write the default configuration to a file
    InitConfig {
        #[arg(short, long, default_value = "subflow.toml")]
        output: PathBuf,
    },
}
