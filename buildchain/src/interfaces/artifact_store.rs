//! The Artifact Store collaborator.

use crate::core::ArtifactRef;
use async_trait::async_trait;
use tokio::io::AsyncRead;
use uuid::Uuid;

/// A byte stream of one stored artifact.
pub type ArtifactReader = Box<dyn AsyncRead + Send + Unpin>;

/// Persists and serves the files a stage publishes on success.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Publishes the stage's files matching `pattern`.
    ///
    /// A pattern matching nothing publishes nothing and is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails; the stage is then failed.
    async fn publish(
        &self,
        run_id: Uuid,
        stage_id: &str,
        pattern: &str,
    ) -> anyhow::Result<Vec<ArtifactRef>>;

    /// Opens a published artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact does not exist or cannot be read.
    async fn fetch(&self, artifact: &ArtifactRef) -> anyhow::Result<ArtifactReader>;
}
