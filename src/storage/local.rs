use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::{Result, SubflowError};
use super::{ObjectStorage, UploadResult};

/// Filesystem-backed storage. Published objects are copied under
/// `publish_dir/<parent-dir>/<file-name>`.
pub struct LocalObjectStorage {
    config: StorageConfig,
    client: Client,
}

impl LocalObjectStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn object_key(local_ref: &Path) -> Result<PathBuf> {
        let file_name = local_ref
            .file_name()
            .ok_or_else(|| SubflowError::Storage(format!("Not a file: {}", local_ref.display())))?;
        let key = match local_ref.parent().and_then(Path::file_name) {
            Some(parent) => Path::new(parent).join(file_name),
            None => PathBuf::from(file_name),
        };
        Ok(key)
    }

    fn public_url(&self, key: &Path, published: &Path) -> Result<String> {
        match &self.config.public_base_url {
            Some(base) => {
                let key = key
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                Ok(format!("{}/{}", base.trim_end_matches('/'), key))
            }
            None => {
                let absolute = std::fs::canonicalize(published)?;
                Ok(format!("file://{}", absolute.display()))
            }
        }
    }

    async fn fetch_http(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        let file_name = url
            .split('?')
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .unwrap_or("source");
        let dest = dest_dir.join(file_name);

        debug!("Downloading {} to {}", url, dest.display());
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status.is_client_error() {
            return Err(SubflowError::Validation(format!("Source {} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(SubflowError::Storage(format!("Source {} returned {}", url, status)));
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(&dest, &bytes).await?;
        Ok(dest)
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload(&self, local_ref: PathBuf) -> Result<UploadResult> {
        let key = Self::object_key(&local_ref)?;
        let published = self.config.publish_dir.join(&key);
        if let Some(parent) = published.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let size_bytes = tokio::fs::copy(&local_ref, &published)
            .await
            .map_err(|e| SubflowError::Storage(format!("Failed to publish {}: {}", local_ref.display(), e)))?;
        let url = self.public_url(&key, &published)?;

        info!("Published {} ({} bytes) as {}", local_ref.display(), size_bytes, url);
        Ok(UploadResult { url, size_bytes })
    }

    async fn download(&self, remote_ref: String, dest_dir: PathBuf) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&dest_dir).await?;

        if remote_ref.starts_with("http://") || remote_ref.starts_with("https://") {
            return self.fetch_http(&remote_ref, &dest_dir).await;
        }

        let path = PathBuf::from(remote_ref.strip_prefix("file://").unwrap_or(&remote_ref));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(SubflowError::Validation(format!("Source not found: {}", path.display())));
        }
        debug!("Using local source {}", path.display());
        Ok(path)
    }
}
