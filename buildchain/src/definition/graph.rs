//! The validated, immutable pipeline graph.

use super::config::{PipelineConfig, VcsRoot};
use super::spec::{DependencyEdge, StageDefinition};
use crate::errors::{LoadError, UnknownStageError};
use crate::pipeline::DependencyResolver;
use std::collections::{HashMap, HashSet};

/// Every stage definition of one loaded configuration, validated acyclic.
///
/// A graph is never mutated after construction; runs hold an `Arc` to the
/// graph that was active when they were created.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    project_id: String,
    project_name: Option<String>,
    version: u64,
    vcs_roots: Vec<VcsRoot>,
    stages: Vec<StageDefinition>,
    index: HashMap<String, usize>,
    resolver: DependencyResolver,
}

impl PipelineGraph {
    /// Validates and compiles a configuration.
    ///
    /// # Errors
    ///
    /// Returns `LoadError` when a stage id is duplicated, a stage is
    /// malformed, a dependency names an unknown stage, a branch filter does
    /// not compile, or the dependencies form a cycle.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, LoadError> {
        let mut roots = HashMap::with_capacity(config.vcs_roots.len());
        for root in &config.vcs_roots {
            roots.insert(root.id.clone(), root.clone());
        }

        let mut index = HashMap::with_capacity(config.stages.len());
        for (i, stage) in config.stages.iter().enumerate() {
            if index.insert(stage.id.clone(), i).is_some() {
                return Err(LoadError::DuplicateStage(stage.id.clone()));
            }
        }

        let stages = config
            .stages
            .iter()
            .map(|stage| StageDefinition::compile(stage, &roots))
            .collect::<Result<Vec<_>, _>>()?;

        for stage in &stages {
            if let Some(edge) = stage
                .dependencies
                .iter()
                .find(|e| !index.contains_key(&e.upstream))
            {
                return Err(UnknownStageError::referenced_by(&edge.upstream, &stage.id).into());
            }
        }

        let resolver = DependencyResolver::new(&stages)?;

        Ok(Self {
            project_id: config.project_id.clone(),
            project_name: config.project_name.clone(),
            version: 0,
            vcs_roots: config.vcs_roots.clone(),
            stages,
            index,
            resolver,
        })
    }

    /// A graph without stages, active before the first load.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            project_id: String::new(),
            project_name: None,
            version: 0,
            vcs_roots: Vec::new(),
            stages: Vec::new(),
            index: HashMap::new(),
            resolver: DependencyResolver::default(),
        }
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Project id.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Project display name, falling back to the id.
    #[must_use]
    pub fn project_name(&self) -> &str {
        self.project_name.as_deref().unwrap_or(&self.project_id)
    }

    /// Load counter of the registry that activated this graph.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Declared VCS roots.
    #[must_use]
    pub fn vcs_roots(&self) -> &[VcsRoot] {
        &self.vcs_roots
    }

    /// Stages in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, stage_id: &str) -> Option<&StageDefinition> {
        self.index.get(stage_id).map(|&i| &self.stages[i])
    }

    /// Returns true if the graph defines the stage.
    #[must_use]
    pub fn contains(&self, stage_id: &str) -> bool {
        self.index.contains_key(stage_id)
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The precomputed ordering and adjacency.
    #[must_use]
    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Stage ids in topological order.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        self.resolver.topological_order()
    }

    /// Dependency edges of a stage.
    #[must_use]
    pub fn upstream_of(&self, stage_id: &str) -> &[DependencyEdge] {
        self.resolver.upstream_of(stage_id)
    }

    /// Direct dependents of a stage.
    #[must_use]
    pub fn downstream_of(&self, stage_id: &str) -> &[String] {
        self.resolver.downstream_of(stage_id)
    }

    /// Returns true if any stage declares a VCS trigger.
    #[must_use]
    pub fn has_triggers(&self) -> bool {
        self.stages.iter().any(StageDefinition::has_triggers)
    }

    /// The given stages plus everything reachable from them in either
    /// direction.
    #[must_use]
    pub fn reachable_from<'a>(&self, seeds: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        let mut reach = HashSet::new();
        for seed in seeds {
            if !self.contains(seed) {
                continue;
            }
            reach.insert(seed.to_string());
            reach.extend(self.resolver.ancestors(seed));
            reach.extend(self.resolver.descendants(seed));
        }
        reach
    }
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailurePolicy;
    use crate::definition::{StageConfig, StepSpec};
    use pretty_assertions::assert_eq;

    fn ci_config() -> PipelineConfig {
        PipelineConfig::new("ci")
            .with_stage(StageConfig::new("Build").with_step(StepSpec::new("make")))
            .with_stage(
                StageConfig::new("Test")
                    .with_step(StepSpec::new("make test"))
                    .depends_on("Build", FailurePolicy::FailToStart),
            )
            .with_stage(
                StageConfig::new("Lint")
                    .with_step(StepSpec::new("make lint"))
                    .depends_on("Build", FailurePolicy::FailToStart),
            )
            .with_stage(
                StageConfig::new("Package")
                    .with_step(StepSpec::new("make dist"))
                    .depends_on("Test", FailurePolicy::FailToStart)
                    .depends_on("Lint", FailurePolicy::AddProblem),
            )
            .with_stage(StageConfig::new("Docs").with_step(StepSpec::new("make docs")))
    }

    #[test]
    fn test_from_config() {
        let graph = PipelineGraph::from_config(&ci_config()).unwrap();

        assert_eq!(graph.project_id(), "ci");
        assert_eq!(graph.project_name(), "ci");
        assert_eq!(graph.len(), 5);
        assert_eq!(
            graph.topological_order(),
            ["Build", "Test", "Lint", "Package", "Docs"]
        );
        assert_eq!(graph.downstream_of("Build"), ["Test", "Lint"]);
        assert_eq!(graph.upstream_of("Package").len(), 2);
        assert!(graph.stage("Docs").is_some());
        assert!(graph.stage("Deploy").is_none());
        assert!(!graph.has_triggers());
    }

    #[test]
    fn test_unknown_dependency() {
        let config = ci_config().with_stage(
            StageConfig::new("Deploy").depends_on("Pakage", FailurePolicy::FailToStart),
        );
        let err = PipelineGraph::from_config(&config).unwrap_err();

        match err {
            LoadError::UnknownStage(e) => {
                assert_eq!(e.stage_id, "Pakage");
                assert_eq!(e.referenced_by.as_deref(), Some("Deploy"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_stage() {
        let config = ci_config().with_stage(StageConfig::new("Build"));
        assert!(matches!(
            PipelineGraph::from_config(&config),
            Err(LoadError::DuplicateStage(id)) if id == "Build"
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let config = PipelineConfig::new("loop")
            .with_stage(StageConfig::new("a").depends_on("c", FailurePolicy::FailToStart))
            .with_stage(StageConfig::new("b").depends_on("a", FailurePolicy::FailToStart))
            .with_stage(StageConfig::new("c").depends_on("b", FailurePolicy::Ignore));

        let Err(LoadError::CyclicDependency(err)) = PipelineGraph::from_config(&config) else {
            panic!("expected a cycle error");
        };
        let mut members = err.members().to_vec();
        members.sort();
        assert_eq!(members, ["a", "b", "c"]);
    }

    #[test]
    fn test_reachable_from() {
        let graph = PipelineGraph::from_config(&ci_config()).unwrap();

        let mut reach: Vec<_> = graph.reachable_from(["Lint"]).into_iter().collect();
        reach.sort();
        assert_eq!(reach, ["Build", "Lint", "Package"]);

        let docs = graph.reachable_from(["Docs", "Unknown"]);
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_empty_graph() {
        let graph = PipelineGraph::empty();
        assert!(graph.is_empty());
        assert_eq!(graph.version(), 0);
        assert!(graph.topological_order().is_empty());
    }
}
