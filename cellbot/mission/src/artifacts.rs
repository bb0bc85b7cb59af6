use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use cell_links::{Artifact, ArtifactMeta, CaptureApi, LinkError, TimeWindow};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, warn};

use crate::retry::{with_retry_when, RetryError, RetryPolicy};

/// How many captures a window must contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactExpectation {
    /// Exactly one capture.
    ExactlyOne,
    /// One or more captures.
    AtLeastOne,
    /// Any number, including none (trailing windows).
    Any,
}

impl ArtifactExpectation {
    fn accepts(self, found: usize) -> bool {
        match self {
            Self::ExactlyOne => found == 1,
            Self::AtLeastOne => found >= 1,
            Self::Any => true,
        }
    }
}

/// One retrieval job: everything a node captured inside a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalRequest {
    /// Element the captures belong to.
    pub element_id: String,
    /// Restrict to one capture channel.
    pub channel: Option<String>,
    /// Capture window.
    pub window: TimeWindow,
    /// Required capture count.
    pub expectation: ArtifactExpectation,
}

/// Failure of one retrieval sub-step.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The window held the wrong number of captures.
    #[error("element {element_id}: expected {expected:?} capture(s), found {found}")]
    CountMismatch {
        /// Element id.
        element_id: String,
        /// Required count.
        expected: ArtifactExpectation,
        /// Captures found.
        found: usize,
    },
    /// Listing the capture back-end failed.
    #[error("element {element_id}: listing captures failed: {source}")]
    Listing {
        /// Element id.
        element_id: String,
        /// Retry outcome.
        source: RetryError<LinkError>,
    },
    /// Downloading one capture failed.
    #[error("capture {artifact_id}: download failed: {source}")]
    Download {
        /// Capture id.
        artifact_id: String,
        /// Retry outcome.
        source: RetryError<LinkError>,
    },
    /// The sink refused the capture.
    #[error("capture {artifact_id}: sink failed: {message}")]
    Sink {
        /// Capture id.
        artifact_id: String,
        /// Sink error text.
        message: String,
    },
    /// The worker task panicked or was aborted.
    #[error("retrieval worker failed: {0}")]
    Worker(String),
}

/// Destination for downloaded captures.
#[async_trait]
pub trait CaptureSink: Send + Sync {
    /// Stores one capture taken while `element_id` ran.
    async fn store(&self, element_id: &str, artifact: Artifact) -> anyhow::Result<()>;
}

/// Sink keeping captures in memory.
#[derive(Debug, Default)]
pub struct MemoryCaptureSink {
    stored: Mutex<Vec<(String, Artifact)>>,
}

impl MemoryCaptureSink {
    /// Stored captures with their element ids.
    #[must_use]
    pub fn stored(&self) -> Vec<(String, Artifact)> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl CaptureSink for MemoryCaptureSink {
    async fn store(&self, element_id: &str, artifact: Artifact) -> anyhow::Result<()> {
        self.stored.lock().push((element_id.to_string(), artifact));
        Ok(())
    }
}

/// Sink writing each capture to `<root>/<element>/<channel>_<id>.bin`.
#[derive(Debug, Clone)]
pub struct DirectoryCaptureSink {
    root: PathBuf,
}

impl DirectoryCaptureSink {
    /// Creates a sink under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl CaptureSink for DirectoryCaptureSink {
    async fn store(&self, element_id: &str, artifact: Artifact) -> anyhow::Result<()> {
        let dir = self.root.join(element_id);
        tokio::fs::create_dir_all(&dir).await?;
        let name = format!("{}_{}.bin", artifact.meta.channel, artifact.meta.id);
        tokio::fs::write(dir.join(name), &artifact.bytes).await?;
        Ok(())
    }
}

/// Result of one finished retrieval job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalOutcome {
    /// Element id.
    pub element_id: String,
    /// Captures stored.
    pub stored: usize,
}

/// Totals over every job spawned during one mission.
#[derive(Debug, Default)]
pub struct RetrievalSummary {
    /// Finished jobs.
    pub succeeded: Vec<RetrievalOutcome>,
    /// Failed jobs.
    pub failed: Vec<ArtifactError>,
}

impl RetrievalSummary {
    /// Jobs that ran, successful or not.
    #[must_use]
    pub fn jobs(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Spawns bounded retrieval workers and joins them on demand.
pub struct ArtifactRetriever {
    capture: Arc<dyn CaptureApi>,
    sink: Arc<dyn CaptureSink>,
    policy: RetryPolicy,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<RetrievalOutcome, ArtifactError>>,
}

impl std::fmt::Debug for ArtifactRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRetriever")
            .field("outstanding", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl ArtifactRetriever {
    /// Creates a retriever running at most `max_concurrency` downloads at once.
    #[must_use]
    pub fn new(
        capture: Arc<dyn CaptureApi>,
        sink: Arc<dyn CaptureSink>,
        policy: RetryPolicy,
        max_concurrency: usize,
    ) -> Self {
        Self {
            capture,
            sink,
            policy,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tasks: JoinSet::new(),
        }
    }

    /// Starts a job in the background.
    pub fn spawn(&mut self, request: RetrievalRequest) {
        let capture = Arc::clone(&self.capture);
        let sink = Arc::clone(&self.sink);
        let semaphore = Arc::clone(&self.semaphore);
        let policy = self.policy.clone();
        debug!(element = %request.element_id, "spawning capture retrieval");
        self.tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|err| ArtifactError::Worker(err.to_string()))?;
            retrieve(capture.as_ref(), sink.as_ref(), &policy, request).await
        });
    }

    /// Jobs not yet joined.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every spawned job.
    pub async fn join_all(&mut self) -> RetrievalSummary {
        let mut summary = RetrievalSummary::default();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => summary.succeeded.push(outcome),
                Ok(Err(err)) => {
                    warn!(error = %err, "capture retrieval failed");
                    summary.failed.push(err);
                }
                Err(err) => summary.failed.push(ArtifactError::Worker(err.to_string())),
            }
        }
        summary
    }
}

async fn retrieve(
    capture: &dyn CaptureApi,
    sink: &dyn CaptureSink,
    policy: &RetryPolicy,
    request: RetrievalRequest,
) -> Result<RetrievalOutcome, ArtifactError> {
    let listed = with_retry_when(policy, LinkError::is_transient, |_| {
        capture.list_artifacts(&request.window)
    })
    .await
    .map_err(|source| ArtifactError::Listing {
        element_id: request.element_id.clone(),
        source,
    })?;
    let matching: Vec<ArtifactMeta> = listed
        .into_iter()
        .filter(|meta| {
            request
                .channel
                .as_ref()
                .map_or(true, |channel| &meta.channel == channel)
        })
        .collect();
    if !request.expectation.accepts(matching.len()) {
        return Err(ArtifactError::CountMismatch {
            element_id: request.element_id,
            expected: request.expectation,
            found: matching.len(),
        });
    }
    for meta in &matching {
        let artifact = with_retry_when(policy, LinkError::is_transient, |_| {
            capture.download_artifact(meta)
        })
        .await
        .map_err(|source| ArtifactError::Download {
            artifact_id: meta.id.clone(),
            source,
        })?;
        sink.store(&request.element_id, artifact)
            .await
            .map_err(|err| ArtifactError::Sink {
                artifact_id: meta.id.clone(),
                message: err.to_string(),
            })?;
    }
    Ok(RetrievalOutcome {
        element_id: request.element_id,
        stored: matching.len(),
    })
}
