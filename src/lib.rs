//! subflow - subtitle job orchestration
//!
//! Tracks media jobs through transcription, translation, rendering and
//! upload: a central state machine, a retrying phase runner, progress
//! estimation, an append-only event log per job and a cache-backed job
//! store, driven by the [`orchestrator::Orchestrator`].

pub mod admission;
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod media;
pub mod notifier;
pub mod orchestrator;
pub mod progress;
pub mod runner;
pub mod state;
pub mod storage;
pub mod store;
pub mod subtitle;
pub mod transcribe;
pub mod translate;
pub mod validate;
