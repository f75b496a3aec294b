//! Which stages a change event instantiates, and which of them are skipped.

use crate::core::ChangeEvent;
use crate::definition::PipelineGraph;
use crate::errors::UnknownStageError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How the triggering stages of a run are chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scope", content = "stages", rename_all = "snake_case")]
pub enum TriggerScope {
    /// Stages whose VCS trigger matches the event. A graph without any
    /// trigger is unscoped and runs whole.
    #[default]
    Vcs,
    /// The given stages, as if their triggers had fired.
    Stages(Vec<String>),
    /// Every stage.
    All,
}

/// The instance set of a new run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    /// Member stage ids, in topological order.
    pub members: Vec<String>,
    /// Stages that started the run.
    pub triggered: HashSet<String>,
    /// Members skipped at creation.
    pub skipped: HashSet<String>,
}

impl RunPlan {
    /// Returns true if the stage is part of the run.
    #[must_use]
    pub fn contains(&self, stage_id: &str) -> bool {
        self.members.iter().any(|m| m == stage_id)
    }
}

/// Computes the run for an event, or `None` if no stage is triggered.
///
/// The run holds the triggered stages plus all their ancestors and
/// descendants. Walking in reverse topological order, a member that is not
/// triggered, declares a trigger excluding the event, and has no
/// non-skipped direct dependent in the run is skipped.
///
/// # Errors
///
/// Returns `UnknownStageError` if an explicit scope names an unknown stage.
pub fn plan(
    graph: &PipelineGraph,
    event: &ChangeEvent,
    scope: &TriggerScope,
) -> Result<Option<RunPlan>, UnknownStageError> {
    let all = || graph.stages().iter().map(|s| s.id.clone()).collect();
    let triggered: HashSet<String> = match scope {
        TriggerScope::All => all(),
        TriggerScope::Vcs if !graph.has_triggers() => all(),
        TriggerScope::Vcs => graph
            .stages()
            .iter()
            .filter(|s| s.is_triggered_by(event))
            .map(|s| s.id.clone())
            .collect(),
        TriggerScope::Stages(ids) => {
            if let Some(unknown) = ids.iter().find(|id| !graph.contains(id)) {
                return Err(UnknownStageError::new(unknown.as_str()));
            }
            ids.iter().cloned().collect()
        }
    };
    if triggered.is_empty() {
        return Ok(None);
    }

    let reach = graph.reachable_from(triggered.iter().map(String::as_str));
    let members: Vec<String> = graph
        .topological_order()
        .iter()
        .filter(|id| reach.contains(*id))
        .cloned()
        .collect();

    let mut skipped = HashSet::new();
    for id in members.iter().rev() {
        if triggered.contains(id) {
            continue;
        }
        let Some(stage) = graph.stage(id) else {
            continue;
        };
        if !stage.has_triggers() || stage.is_triggered_by(event) {
            continue;
        }
        let needed = graph
            .downstream_of(id)
            .iter()
            .any(|d| reach.contains(d) && !skipped.contains(d));
        if !needed {
            skipped.insert(id.clone());
        }
    }

    Ok(Some(RunPlan {
        members,
        triggered,
        skipped,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailurePolicy;
    use crate::definition::{PipelineConfig, StageConfig, TriggerConfig};
    use pretty_assertions::assert_eq;

    fn sorted(set: &HashSet<String>) -> Vec<String> {
        let mut v: Vec<_> = set.iter().cloned().collect();
        v.sort();
        v
    }

    /// Build (main, release/*) -> Test -> Deploy (release/* only); Docs (docs/*).
    fn triggered_graph() -> PipelineGraph {
        let config = PipelineConfig::new("ci")
            .with_stage(
                StageConfig::new("Build")
                    .with_trigger(TriggerConfig::branches(["+:main", "+:release/*"])),
            )
            .with_stage(StageConfig::new("Test").depends_on("Build", FailurePolicy::FailToStart))
            .with_stage(
                StageConfig::new("Deploy")
                    .depends_on("Test", FailurePolicy::FailToStart)
                    .with_trigger(TriggerConfig::branches(["+:release/*"])),
            )
            .with_stage(
                StageConfig::new("Docs").with_trigger(TriggerConfig::branches(["+:docs/*"])),
            );
        PipelineGraph::from_config(&config).unwrap()
    }

    #[test]
    fn test_untriggered_graph_runs_whole() {
        let config = PipelineConfig::new("ci")
            .with_stage(StageConfig::new("a"))
            .with_stage(StageConfig::new("b").depends_on("a", FailurePolicy::FailToStart));
        let graph = PipelineGraph::from_config(&config).unwrap();

        let plan = plan(&graph, &ChangeEvent::new("repo", "feature/x", "r1"), &TriggerScope::Vcs)
            .unwrap()
            .unwrap();
        assert_eq!(plan.members, ["a", "b"]);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_excluded_descendant_is_skipped() {
        let graph = triggered_graph();
        let plan = plan(&graph, &ChangeEvent::new("repo", "main", "r1"), &TriggerScope::Vcs)
            .unwrap()
            .unwrap();

        assert_eq!(plan.members, ["Build", "Test", "Deploy"]);
        assert_eq!(sorted(&plan.triggered), ["Build"]);
        assert_eq!(sorted(&plan.skipped), ["Deploy"]);
    }

    #[test]
    fn test_release_branch_triggers_deploy() {
        let graph = triggered_graph();
        let plan = plan(
            &graph,
            &ChangeEvent::new("repo", "refs/heads/release/1.2", "r1"),
            &TriggerScope::Vcs,
        )
        .unwrap()
        .unwrap();

        assert_eq!(sorted(&plan.triggered), ["Build", "Deploy"]);
        assert!(plan.skipped.is_empty());
        assert!(!plan.contains("Docs"));
    }

    #[test]
    fn test_no_matching_trigger() {
        let graph = triggered_graph();
        let plan = plan(&graph, &ChangeEvent::new("repo", "feature/x", "r1"), &TriggerScope::Vcs);
        assert_eq!(plan.unwrap(), None);
    }

    #[test]
    fn test_ancestor_of_triggered_stage_is_kept() {
        let graph = triggered_graph();
        let plan = plan(
            &graph,
            &ChangeEvent::new("repo", "feature/x", "r1"),
            &TriggerScope::Stages(vec!["Deploy".to_string()]),
        )
        .unwrap()
        .unwrap();

        // Build's trigger excludes feature/x but Test depends on it
        assert_eq!(plan.members, ["Build", "Test", "Deploy"]);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_explicit_scope_rejects_unknown_stage() {
        let graph = triggered_graph();
        let err = plan(
            &graph,
            &ChangeEvent::new("repo", "main", "r1"),
            &TriggerScope::Stages(vec!["Nope".to_string()]),
        )
        .unwrap_err();
        assert_eq!(err.stage_id, "Nope");
    }

    #[test]
    fn test_all_scope() {
        let graph = triggered_graph();
        let plan = plan(&graph, &ChangeEvent::new("repo", "x", "r1"), &TriggerScope::All)
            .unwrap()
            .unwrap();
        assert_eq!(plan.members.len(), 4);
        assert!(plan.skipped.is_empty());
    }
}
