//! Artifact storage boundary.
//!
//! The blob store itself is an external collaborator. The builder uploads one
//! packaged archive per build and records the returned location as the
//! build's artifact reference.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildId, Result};

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub build_id: BuildId,
    /// Retrieval location (backend-specific), used as the build's
    /// `artifact_reference`.
    pub location: String,
    /// Hex-encoded SHA-256 of the archive.
    pub checksum: String,
    /// Size in bytes.
    pub size: u64,
    pub stored_at: DateTime<Utc>,
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the archive for a build, replacing any earlier upload.
    async fn put(&self, build_id: BuildId, file_name: &str, data: Bytes) -> Result<ArtifactRef>;

    /// Retrieve the archive for a build. `Error::NotFound` if none was stored.
    async fn get(&self, build_id: BuildId) -> Result<Bytes>;
}
