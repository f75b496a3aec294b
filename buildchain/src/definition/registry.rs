//! The Stage Definition Registry: owns the active pipeline graph.

use super::config::PipelineConfig;
use super::graph::PipelineGraph;
use crate::errors::LoadError;
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Holds the active [`PipelineGraph`] and replaces it on each load.
///
/// The active graph is an immutable snapshot behind an `Arc`: a load swaps
/// the pointer, and runs created earlier keep the snapshot they cloned.
pub struct StageRegistry {
    active: RwLock<Arc<PipelineGraph>>,
    // serializes loads so versions are assigned in activation order
    load_lock: Mutex<u64>,
    sink: Arc<dyn EventSink>,
}

impl StageRegistry {
    /// Creates a registry with an empty active graph.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sink(Arc::new(NoOpEventSink))
    }

    /// Creates a registry publishing load events to `sink`.
    #[must_use]
    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self {
            active: RwLock::new(Arc::new(PipelineGraph::empty())),
            load_lock: Mutex::new(0),
            sink,
        }
    }

    /// Validates a configuration and activates it.
    ///
    /// # Errors
    ///
    /// Returns the `LoadError` that rejected the configuration; the
    /// previously active graph remains in force.
    pub fn load(&self, config: &PipelineConfig) -> Result<Arc<PipelineGraph>, LoadError> {
        let mut version = self.load_lock.lock();

        let graph = match PipelineGraph::from_config(config) {
            Ok(graph) => Arc::new(graph.with_version(*version + 1)),
            Err(err) => {
                let info = err.error_info();
                warn!(
                    project_id = %config.project_id,
                    code = %info.code,
                    error = %err,
                    "Rejected pipeline configuration"
                );
                self.sink.try_emit(&PipelineEvent::GraphRejected {
                    code: info.code,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        *version += 1;
        *self.active.write() = Arc::clone(&graph);

        info!(
            project_id = %graph.project_id(),
            version = graph.version(),
            stages = graph.len(),
            "Activated pipeline graph"
        );
        self.sink.try_emit(&PipelineEvent::GraphLoaded {
            project_id: graph.project_id().to_string(),
            version: graph.version(),
            stages: graph.len(),
        });

        Ok(graph)
    }

    /// Parses and loads a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns `LoadError::Parse` for malformed JSON, or any validation error.
    pub fn load_json(&self, raw: &str) -> Result<Arc<PipelineGraph>, LoadError> {
        let config = PipelineConfig::from_json(raw).map_err(|err| self.reject(err))?;
        self.load(&config)
    }

    /// Reads and loads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns `LoadError::Io` if the file cannot be read, or any parse or
    /// validation error.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Arc<PipelineGraph>, LoadError> {
        let config = PipelineConfig::from_path(path).map_err(|err| self.reject(err))?;
        self.load(&config)
    }

    /// The active graph.
    #[must_use]
    pub fn current_graph(&self) -> Arc<PipelineGraph> {
        Arc::clone(&self.active.read())
    }

    fn reject(&self, err: LoadError) -> LoadError {
        let info = err.error_info();
        warn!(code = %info.code, error = %err, "Rejected pipeline configuration");
        self.sink.try_emit(&PipelineEvent::GraphRejected {
            code: info.code,
            message: err.to_string(),
        });
        err
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.current_graph();
        f.debug_struct("StageRegistry")
            .field("project_id", &graph.project_id())
            .field("version", &graph.version())
            .field("stages", &graph.len())
            .finish()
    }
}
