//! subflow - subtitle job orchestration
//!
//! Command-line front end for the orchestrator: runs jobs through the
//! transcribe, translate, render and upload pipeline and inspects the jobs
//! and events it has stored.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use subflow::cli::{Args, Commands};
use subflow::config::Config;
use subflow::event::EventQuery;
use subflow::job::{Job, JobInput, JobOptions, JobStatus};
use subflow::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _guard = setup_logging(args.verbose)?;

    let config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if std::path::Path::new("subflow.toml").exists() {
                info!("Found subflow.toml in current directory, loading...");
                Config::from_file("subflow.toml")?
            } else {
                Config::default()
            }
        }
    };

    if let Commands::InitConfig { output } = &args.command {
        Config::default().save_to_file(output)?;
        println!("Wrote default configuration to {}", output.display());
        return Ok(());
    }

    let orchestrator = Orchestrator::from_config(config)?;

    match args.command {
        Commands::Process {
            input,
            target_lang,
            source_lang,
            no_render,
            no_upload,
            style,
            timeout_secs,
        } => {
            let options = JobOptions {
                render: !no_render,
                upload: !no_upload,
                style,
                source_language: source_lang,
                source_key: None,
                timeout_secs,
            };
            let receipt = orchestrator
                .create_job(JobInput::new(input, target_lang).with_options(options))
                .await?;
            info!("Created job {}", receipt.job_id);

            let job = follow(&orchestrator, &receipt.job).await?;
            println!("{}", serde_json::to_string_pretty(&summary(&job))?);
            if job.status != JobStatus::Done {
                anyhow::bail!("job {} ended as {}", job.id, job.status);
            }
        }
        Commands::Status { job_id } => {
            let job = orchestrator.get_job(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Events {
            job_id,
            event_type,
            severity,
            category,
            phase,
            tags,
            limit,
            offset,
        } => {
            let query = EventQuery {
                event_type,
                severity,
                category,
                phase,
                tags,
                limit,
                offset,
                ..EventQuery::default()
            };
            let page = orchestrator.get_events(&job_id, &query).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Commands::List { status } => {
            let jobs = orchestrator.list_jobs(status).await;
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<38} {:<13} {:>6} {:<8} {:<40}", "Job", "Status", "Pct", "Lang", "Source");
                println!("{}", "-".repeat(108));
                for job in jobs {
                    println!(
                        "{:<38} {:<13} {:>5.1}% {:<8} {:<40}",
                        job.id, job.status, job.progress.percentage, job.input.target_language, job.input.source_ref
                    );
                }
            }
        }
        Commands::Sweep { days } => {
            let swept = match days {
                Some(days) => orchestrator.sweep_older_than(chrono::Duration::days(days as i64)).await,
                None => orchestrator.sweep().await,
            };
            println!("Removed {} job(s)", swept.len());
        }
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

/// Poll the job and mirror its progress on a bar until it finishes.
async fn follow(orchestrator: &Orchestrator, job: &Job) -> Result<Job> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("#>-"),
    );

    let finished = orchestrator.wait(&job.id);
    tokio::pin!(finished);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    let job = loop {
        tokio::select! {
            result = &mut finished => break result?,
            _ = ticker.tick() => {
                let snapshot = orchestrator.get_job(&job.id).await?;
                pb.set_position(snapshot.progress.percentage as u64);
                pb.set_message(snapshot.progress.message.clone());
            }
        }
    };

    pb.set_position(job.progress.percentage as u64);
    pb.finish_with_message(job.progress.message.clone());
    Ok(job)
}

fn summary(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "job_id": job.id,
        "status": job.status,
        "phase": job.phase,
        "published_url": job.output.as_ref().and_then(|o| o.published_url.clone()),
        "caption_track": job.output.as_ref().map(|o| o.caption_track.clone()),
        "rendered": job.output.as_ref().and_then(|o| o.rendered.clone()),
        "stats": job.output.as_ref().map(|o| o.stats.clone()),
        "error": job.error,
        "retry_count": job.metadata.retry_count,
        "notification": job.metadata.notification,
        "events": job.events.len(),
    })
}

fn setup_logging(verbose: bool) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = std::env::current_dir()?.join(".subflow").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "subflow.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false); // No ANSI colors in file

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("subflow.log").display()
    );
    Ok(guard)
}
