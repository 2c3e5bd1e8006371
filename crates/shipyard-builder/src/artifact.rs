//! Artifact store clients.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use sha2::{Digest, Sha256};
use shipyard_core::{ArtifactRef, ArtifactStore, BuildId, Error, Result};
use tracing::info;

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Client for the external storage service.
///
/// Uploads are `POST {base}/artifacts/{build_id}` with the archive in the
/// multipart field `artifact`. The same URL serves the archive back and is
/// the build's artifact reference.
pub struct HttpArtifactStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArtifactStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, build_id: BuildId) -> String {
        format!("{}/artifacts/{}", self.base_url, build_id)
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn put(&self, build_id: BuildId, file_name: &str, data: Bytes) -> Result<ArtifactRef> {
        let url = self.url_for(build_id);
        let size = data.len() as u64;
        let checksum = checksum(&data);

        let part = Part::stream(data)
            .file_name(file_name.to_string())
            .mime_str("application/gzip")
            .map_err(|e| Error::Internal(e.to_string()))?;
        let form = Form::new().part("artifact", part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("upload request failed: {}", e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "storage service returned status {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        info!(build_id = %build_id, url = %url, size, checksum = %checksum, "Artifact uploaded");
        Ok(ArtifactRef {
            build_id,
            location: url,
            checksum,
            size,
            stored_at: Utc::now(),
        })
    }

    async fn get(&self, build_id: BuildId) -> Result<Bytes> {
        let url = self.url_for(build_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("download request failed: {}", e)))?;

        match response.status() {
            StatusCode::OK => response
                .bytes()
                .await
                .map_err(|e| Error::Internal(format!("download failed: {}", e))),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("artifact {}", build_id))),
            other => Err(Error::Internal(format!(
                "storage service returned status {}",
                other.as_u16()
            ))),
        }
    }
}

/// Stores archives under a local directory, one subdirectory per build.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn dir_for(&self, build_id: BuildId) -> PathBuf {
        self.root.join(build_id.to_string())
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, build_id: BuildId, file_name: &str, data: Bytes) -> Result<ArtifactRef> {
        let name = Path::new(file_name)
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("invalid artifact name: {}", file_name)))?;

        let dir = self.dir_for(build_id);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(name);
        tokio::fs::write(&path, &data).await?;

        let checksum = checksum(&data);
        info!(build_id = %build_id, path = %path.display(), size = data.len(), checksum = %checksum, "Artifact stored");
        Ok(ArtifactRef {
            build_id,
            location: path.display().to_string(),
            checksum,
            size: data.len() as u64,
            stored_at: Utc::now(),
        })
    }

    async fn get(&self, build_id: BuildId) -> Result<Bytes> {
        let dir = self.dir_for(build_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("artifact {}", build_id)));
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                return Ok(Bytes::from(tokio::fs::read(entry.path()).await?));
            }
        }
        Err(Error::NotFound(format!("artifact {}", build_id)))
    }
}
