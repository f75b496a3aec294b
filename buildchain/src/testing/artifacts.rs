//! An artifact store that keeps everything in memory.

use crate::core::ArtifactRef;
use crate::definition::wildcard_regex;
use crate::interfaces::{ArtifactReader, ArtifactStore};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use uuid::Uuid;

/// Keeps stage output files and published blobs in memory.
///
/// Files put for a stage id are visible to every run of that stage; publishing
/// copies the matching files under the run's location.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    workspace: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    published: RwLock<Vec<ArtifactRef>>,
    failing: RwLock<HashSet<String>>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a file in a stage's output.
    pub fn put(&self, stage_id: &str, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.workspace
            .write()
            .entry(stage_id.to_string())
            .or_default()
            .insert(path.into(), bytes.into());
    }

    /// Makes every publication for the stage fail.
    pub fn fail_publish(&self, stage_id: &str) {
        self.failing.write().insert(stage_id.to_string());
    }

    /// Every reference published so far.
    #[must_use]
    pub fn published(&self) -> Vec<ArtifactRef> {
        self.published.read().clone()
    }

    /// Reads a published blob without going through [`ArtifactStore::fetch`].
    #[must_use]
    pub fn contents(&self, artifact: &ArtifactRef) -> Option<Vec<u8>> {
        self.blobs.read().get(&artifact.location()).cloned()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn publish(
        &self,
        run_id: Uuid,
        stage_id: &str,
        pattern: &str,
    ) -> anyhow::Result<Vec<ArtifactRef>> {
        if self.failing.read().contains(stage_id) {
            bail!("storage unavailable for stage '{stage_id}'");
        }
        let matcher = wildcard_regex(pattern)
            .with_context(|| format!("invalid artifact pattern '{pattern}'"))?;

        let files: Vec<(String, Vec<u8>)> = self
            .workspace
            .read()
            .get(stage_id)
            .map(|files| {
                files
                    .iter()
                    .filter(|(path, _)| matcher.is_match(path))
                    .map(|(path, bytes)| (path.clone(), bytes.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut refs = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            let artifact = ArtifactRef::new(run_id, stage_id, pattern, path)
                .with_size(bytes.len() as u64)
                .with_digest(hex::encode(Sha256::digest(&bytes)));
            self.blobs.write().insert(artifact.location(), bytes);
            refs.push(artifact);
        }
        self.published.write().extend(refs.iter().cloned());
        Ok(refs)
    }

    async fn fetch(&self, artifact: &ArtifactRef) -> anyhow::Result<ArtifactReader> {
        let bytes = self
            .contents(artifact)
            .ok_or_else(|| anyhow!("artifact not found: {artifact}"))?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}
