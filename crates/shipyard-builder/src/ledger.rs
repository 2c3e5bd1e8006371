//! Suppression of redelivered jobs.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use shipyard_core::{BuildId, BuildRecord, Error, Phase, Result};
use shipyard_db::{BuildStore, DbError};

/// Bounded set of build ids this worker has already started.
pub struct JobLedger {
    capacity: usize,
    inner: Mutex<LedgerInner>,
}

#[derive(Default)]
struct LedgerInner {
    seen: HashSet<BuildId>,
    order: VecDeque<BuildId>,
}

impl JobLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Record `id` as started. Returns `false` if it was already recorded.
    pub fn begin(&self, id: BuildId) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !inner.seen.insert(id) {
            return false;
        }
        inner.order.push_back(id);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(inner) => inner.order.len(),
            Err(poisoned) => poisoned.into_inner().order.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobLedger {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Reads the current phase of a build from whoever owns build state.
#[async_trait]
pub trait BuildLookup: Send + Sync {
    /// `None` if the build is unknown.
    async fn phase(&self, id: BuildId) -> Result<Option<Phase>>;
}

/// Asks the orchestrator's query API.
pub struct HttpBuildLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBuildLookup {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BuildLookup for HttpBuildLookup {
    async fn phase(&self, id: BuildId) -> Result<Option<Phase>> {
        let url = format!("{}/builds/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("build lookup failed: {}", e)))?;
        match response.status() {
            StatusCode::OK => {
                let record: BuildRecord = response
                    .json()
                    .await
                    .map_err(|e| Error::Internal(format!("invalid build record: {}", e)))?;
                Ok(Some(record.phase))
            }
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(Error::Internal(format!(
                "build lookup returned status {}",
                other.as_u16()
            ))),
        }
    }
}

/// Reads the build store directly, for single-process deployments.
pub struct StoreBuildLookup {
    store: Arc<dyn BuildStore>,
}

impl StoreBuildLookup {
    pub fn new(store: Arc<dyn BuildStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BuildLookup for StoreBuildLookup {
    async fn phase(&self, id: BuildId) -> Result<Option<Phase>> {
        match self.store.get_record(id).await {
            Ok(record) => Ok(Some(record.phase)),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(e) => Err(Error::Internal(e.to_string())),
        }
    }
}
