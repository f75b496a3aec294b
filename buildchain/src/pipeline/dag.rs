//! Dependency resolution for the pipeline graph.
//!
//! Computes a topological order used as a scheduling hint, detects cycles,
//! and precomputes adjacency so the scheduler can look up a stage's
//! upstream edges and downstream dependents without scanning the graph.

use crate::definition::{DependencyEdge, StageDefinition};
use crate::errors::CyclicDependencyError;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Resolves the topological order of a set of stage definitions.
///
/// Ties are broken by declaration order, so the result is deterministic.
///
/// # Errors
///
/// Returns `CyclicDependencyError` naming the stages of a cycle.
pub fn resolve(stages: &[StageDefinition]) -> Result<Vec<String>, CyclicDependencyError> {
    DependencyResolver::new(stages).map(|r| r.order)
}

/// Precomputed ordering and adjacency of a validated stage graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    order: Vec<String>,
    position: HashMap<String, usize>,
    upstream: HashMap<String, Vec<DependencyEdge>>,
    downstream: HashMap<String, Vec<String>>,
}

impl DependencyResolver {
    /// Builds the resolver.
    ///
    /// Edges to ids outside `stages` are ignored; the graph rejects them
    /// before resolution.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependencyError` if the dependency edges form a cycle.
    pub fn new(stages: &[StageDefinition]) -> Result<Self, CyclicDependencyError> {
        let index: HashMap<&str, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        // upstream edges per stage, by declaration index
        let deps: Vec<Vec<usize>> = stages
            .iter()
            .map(|s| {
                s.dependencies
                    .iter()
                    .filter_map(|e| index.get(e.upstream.as_str()).copied())
                    .collect()
            })
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
        for (i, ups) in deps.iter().enumerate() {
            for &u in ups {
                dependents[u].push(i);
            }
        }

        // Kahn's algorithm, smallest declaration index first
        let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut sorted = Vec::with_capacity(stages.len());
        while let Some(Reverse(i)) = ready.pop() {
            sorted.push(i);
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }

        if sorted.len() < stages.len() {
            let remaining: HashSet<usize> = (0..stages.len())
                .filter(|i| in_degree[*i] > 0)
                .collect();
            let cycle = find_cycle(&deps, &remaining)
                .into_iter()
                .map(|i| stages[i].id.clone())
                .collect();
            return Err(CyclicDependencyError::new(cycle));
        }

        let order: Vec<String> = sorted.iter().map(|&i| stages[i].id.clone()).collect();
        let position: HashMap<String, usize> = order
            .iter()
            .enumerate()
            .map(|(p, id)| (id.clone(), p))
            .collect();

        let upstream = stages
            .iter()
            .map(|s| {
                let edges = s
                    .dependencies
                    .iter()
                    .filter(|e| index.contains_key(e.upstream.as_str()))
                    .cloned()
                    .collect();
                (s.id.clone(), edges)
            })
            .collect();

        let downstream = stages
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut ids: Vec<&String> = dependents[i].iter().map(|&d| &stages[d].id).collect();
                ids.sort_by_key(|id| position[*id]);
                (s.id.clone(), ids.into_iter().cloned().collect())
            })
            .collect();

        Ok(Self {
            order,
            position,
            upstream,
            downstream,
        })
    }

    /// Stage ids in topological order (upstream before downstream).
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Position of a stage in the topological order.
    #[must_use]
    pub fn position(&self, stage_id: &str) -> Option<usize> {
        self.position.get(stage_id).copied()
    }

    /// Dependency edges of a stage.
    #[must_use]
    pub fn upstream_of(&self, stage_id: &str) -> &[DependencyEdge] {
        self.upstream.get(stage_id).map_or(&[], Vec::as_slice)
    }

    /// Direct dependents of a stage, in topological order.
    #[must_use]
    pub fn downstream_of(&self, stage_id: &str) -> &[String] {
        self.downstream.get(stage_id).map_or(&[], Vec::as_slice)
    }

    /// All transitive dependencies of a stage.
    #[must_use]
    pub fn ancestors(&self, stage_id: &str) -> HashSet<String> {
        self.walk(stage_id, |id| {
            self.upstream_of(id).iter().map(|e| e.upstream.as_str()).collect()
        })
    }

    /// All transitive dependents of a stage.
    #[must_use]
    pub fn descendants(&self, stage_id: &str) -> HashSet<String> {
        self.walk(stage_id, |id| {
            self.downstream_of(id).iter().map(String::as_str).collect()
        })
    }

    fn walk<'a>(
        &'a self,
        start: &str,
        next: impl Fn(&str) -> Vec<&'a str>,
    ) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = next(start);
        while let Some(id) = stack.pop() {
            if seen.insert(id.to_string()) {
                stack.extend(next(id));
            }
        }
        seen
    }
}

/// Depth-first search with three colors over the stages left by Kahn's
/// algorithm; every one of them lies on or behind a cycle.
fn find_cycle(deps: &[Vec<usize>], remaining: &HashSet<usize>) -> Vec<usize> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: usize,
        deps: &[Vec<usize>],
        remaining: &HashSet<usize>,
        color: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        color[node] = Color::Gray;
        path.push(node);
        for &dep in deps[node].iter().filter(|d| remaining.contains(*d)) {
            match color[dep] {
                Color::White => {
                    if let Some(cycle) = visit(dep, deps, remaining, color, path) {
                        return Some(cycle);
                    }
                }
                Color::Gray => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Color::Black => {}
            }
        }
        path.pop();
        color[node] = Color::Black;
        None
    }

    let mut color = vec![Color::White; deps.len()];
    let mut starts: Vec<usize> = remaining.iter().copied().collect();
    starts.sort_unstable();
    for start in starts {
        if color[start] == Color::White {
            let mut path = Vec::new();
            if let Some(cycle) = visit(start, deps, remaining, &mut color, &mut path) {
                return cycle;
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailurePolicy;
    use crate::definition::StageConfig;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn stage(id: &str, deps: &[&str]) -> StageDefinition {
        let config = deps.iter().fold(StageConfig::new(id), |c, d| {
            c.depends_on(*d, FailurePolicy::FailToStart)
        });
        StageDefinition::compile(&config, &HashMap::new()).unwrap()
    }

    fn ci_graph() -> Vec<StageDefinition> {
        vec![
            stage("Build", &[]),
            stage("TestSuite", &["Build"]),
            stage("CodeQuality", &["Build"]),
            stage("Package", &["TestSuite", "CodeQuality"]),
        ]
    }

    #[test]
    fn test_topological_order() {
        let order = resolve(&ci_graph()).unwrap();
        assert_eq!(order, vec!["Build", "TestSuite", "CodeQuality", "Package"]);
    }

    #[test]
    fn test_declaration_order_does_not_matter() {
        let mut stages = ci_graph();
        stages.reverse();
        let order = resolve(&stages).unwrap();
        assert_eq!(order.first().map(String::as_str), Some("Build"));
        assert_eq!(order.last().map(String::as_str), Some("Package"));
    }

    #[test]
    fn test_adjacency() {
        let resolver = DependencyResolver::new(&ci_graph()).unwrap();
        assert_eq!(resolver.downstream_of("Build"), ["TestSuite", "CodeQuality"]);
        assert_eq!(resolver.upstream_of("Package").len(), 2);
        assert!(resolver.downstream_of("Package").is_empty());
        assert!(resolver.upstream_of("Missing").is_empty());

        let ancestors = resolver.ancestors("Package");
        assert_eq!(ancestors.len(), 3);
        assert!(resolver.descendants("Build").contains("Package"));
        assert!(resolver.descendants("Package").is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let stages = vec![
            stage("a", &["c"]),
            stage("b", &["a"]),
            stage("c", &["b"]),
            stage("d", &[]),
        ];
        let err = resolve(&stages).unwrap_err();

        let mut members = err.members().to_vec();
        members.sort();
        assert_eq!(members, vec!["a", "b", "c"]);
        assert_eq!(err.cycle.first(), err.cycle.last());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = resolve(&[stage("a", &["a"])]).unwrap_err();
        assert_eq!(err.cycle, vec!["a", "a"]);
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        // "root" is blocked by the cycle but is not part of it
        let stages = vec![
            stage("root", &["x"]),
            stage("x", &["y"]),
            stage("y", &["x"]),
        ];
        let err = resolve(&stages).unwrap_err();
        assert!(!err.members().contains(&"root".to_string()));
    }

    #[test]
    fn test_random_dags_respect_edges() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let n = rng.gen_range(1..30);
            let ids: Vec<String> = (0..n).map(|i| format!("s{i}")).collect();
            let mut stages: Vec<StageDefinition> = (0..n)
                .map(|i| {
                    let deps: Vec<&str> = (0..i)
                        .filter(|_| rng.gen_bool(0.2))
                        .map(|j| ids[j].as_str())
                        .collect();
                    stage(&ids[i], &deps)
                })
                .collect();
            stages.shuffle(&mut rng);

            let resolver = DependencyResolver::new(&stages).unwrap();
            assert_eq!(resolver.topological_order().len(), n);
            for s in &stages {
                for edge in &s.dependencies {
                    assert!(resolver.position(&edge.upstream) < resolver.position(&s.id));
                }
            }
        }
    }
}
