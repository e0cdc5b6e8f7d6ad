// Object storage
//
// Used twice per job: to fetch the source media before transcription and to
// publish the final artifact. `LocalObjectStorage` serves both from the
// local filesystem (with HTTP(S) download support).

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use local::LocalObjectStorage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub url: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Publish a local file and return where it can be fetched from.
    async fn upload(&self, local_ref: PathBuf) -> crate::error::Result<UploadResult>;

    /// Make `remote_ref` available locally under `dest_dir`.
    async fn download(&self, remote_ref: String, dest_dir: PathBuf) -> crate::error::Result<PathBuf>;
}
