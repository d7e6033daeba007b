//! Static stage ordering and artifact contracts.
//!
//! A stage depends on the stages producing its input categories. Graphs are
//! validated when constructed, so a cycle is a load-time error rather than a
//! run-time one.

use crate::core::{ArtifactCategory, StageDefinition, StageName};
use crate::errors::ConfigurationError;
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

/// Validated pipeline declaration.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    /// Definitions in declaration order.
    definitions: Vec<StageDefinition>,
    /// Declaration index per stage.
    index: HashMap<StageName, usize>,
    /// Producing stage per category.
    producers: HashMap<ArtifactCategory, StageName>,
    /// Direct dependencies per stage.
    dependencies: HashMap<StageName, BTreeSet<StageName>>,
}

#[derive(Deserialize)]
struct GraphDocument {
    stages: Vec<StageDefinition>,
}

impl PipelineGraph {
    /// Validates and builds a graph from definitions in declaration order.
    pub fn new(definitions: Vec<StageDefinition>) -> Result<Self, ConfigurationError> {
        if definitions.is_empty() {
            return Err(ConfigurationError::new("pipeline declares no stages"));
        }

        let mut index = HashMap::new();
        for (i, def) in definitions.iter().enumerate() {
            if index.insert(def.name, i).is_some() {
                return Err(ConfigurationError::new(format!("stage '{}' is declared twice", def.name))
                    .with_stages(vec![def.name.to_string()])
                    .with_code("CONFIG-DUPLICATE-STAGE"));
            }
            if def.outputs.is_empty() {
                return Err(ConfigurationError::new(format!("stage '{}' declares no outputs", def.name))
                    .with_stages(vec![def.name.to_string()]));
            }
        }

        let mut producers: HashMap<ArtifactCategory, StageName> = HashMap::new();
        for def in &definitions {
            for output in &def.outputs {
                if let Some(existing) = producers.insert(output.clone(), def.name) {
                    return Err(ConfigurationError::new(format!(
                        "category '{output}' is produced by both '{existing}' and '{}'",
                        def.name
                    ))
                    .with_stages(vec![existing.to_string(), def.name.to_string()])
                    .with_code("CONFIG-DUPLICATE-PRODUCER"));
                }
            }
        }

        let mut dependencies = HashMap::new();
        for def in &definitions {
            let mut deps = BTreeSet::new();
            for input in &def.inputs {
                let producer = producers.get(input).ok_or_else(|| {
                    ConfigurationError::new(format!(
                        "stage '{}' consumes '{input}' which no stage produces",
                        def.name
                    ))
                    .with_stages(vec![def.name.to_string()])
                    .with_code("CONFIG-UNKNOWN-PRODUCER")
                })?;
                deps.insert(*producer);
            }
            dependencies.insert(def.name, deps);
        }

        let graph = Self {
            definitions,
            index,
            producers,
            dependencies,
        };
        if let Some(cycle) = graph.find_cycle() {
            return Err(ConfigurationError::cycle(
                cycle.iter().map(ToString::to_string).collect(),
            ));
        }
        Ok(graph)
    }

    /// The default quantum project pipeline.
    #[must_use]
    pub fn standard() -> Self {
        let definitions = vec![
            StageDefinition::new(StageName::Generate)
                .with_source()
                .output("ir/base"),
            StageDefinition::new(StageName::Optimize)
                .input("ir/base")
                .output("ir/optimized"),
            StageDefinition::new(StageName::Mitigate)
                .input("ir/optimized")
                .output("ir/mitigated"),
            StageDefinition::new(StageName::Validate)
                .input("ir/base")
                .output("results/validation")
                .output("results/security"),
            StageDefinition::new(StageName::Simulate)
                .input("ir/base")
                .input("ir/optimized")
                .output("results/simulation/base")
                .output("results/simulation/optimized"),
            StageDefinition::new(StageName::Analyze)
                .input("results/simulation/base")
                .input("results/simulation/optimized")
                .output("results/analysis/report"),
            StageDefinition::new(StageName::Test)
                .input("ir/optimized")
                .output("results/tests/report"),
        ];
        #[allow(clippy::expect_used)]
        Self::new(definitions).expect("standard pipeline is valid")
    }

    /// Parses a graph from `{"stages": [...]}` JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        let doc: GraphDocument = serde_json::from_str(json)
            .map_err(|e| ConfigurationError::new(format!("invalid pipeline document: {e}")))?;
        Self::new(doc.stages)
    }

    /// Definitions in declaration order.
    #[must_use]
    pub fn definitions(&self) -> &[StageDefinition] {
        &self.definitions
    }

    /// Returns the definition of `stage`.
    #[must_use]
    pub fn definition(&self, stage: StageName) -> Option<&StageDefinition> {
        self.index.get(&stage).map(|&i| &self.definitions[i])
    }

    /// Returns true if the graph declares `stage`.
    #[must_use]
    pub fn contains(&self, stage: StageName) -> bool {
        self.index.contains_key(&stage)
    }

    /// The stage producing `category`.
    #[must_use]
    pub fn producer_of(&self, category: &ArtifactCategory) -> Option<StageName> {
        self.producers.get(category).copied()
    }

    /// Every category some stage produces, sorted.
    #[must_use]
    pub fn output_categories(&self) -> Vec<ArtifactCategory> {
        let mut categories: Vec<_> = self.producers.keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Direct dependencies of `stage`.
    #[must_use]
    pub fn dependencies_of(&self, stage: StageName) -> BTreeSet<StageName> {
        self.dependencies.get(&stage).cloned().unwrap_or_default()
    }

    /// Stages depending on `stage`, directly or transitively.
    #[must_use]
    pub fn dependents_of(&self, stage: StageName) -> BTreeSet<StageName> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![stage];
        while let Some(current) = frontier.pop() {
            for def in &self.definitions {
                if self.dependencies[&def.name].contains(&current) && found.insert(def.name) {
                    frontier.push(def.name);
                }
            }
        }
        found
    }

    /// All stages in a deterministic topological order.
    ///
    /// Among stages that are ready at the same time, the one declared first
    /// comes first.
    #[must_use]
    pub fn topological_order(&self) -> Vec<StageName> {
        self.order_within(&self.definitions.iter().map(|d| d.name).collect())
    }

    /// Topological order of `requested` plus their transitive dependencies.
    ///
    /// An empty request selects every stage.
    pub fn order_for(&self, requested: &[StageName]) -> Result<Vec<StageName>, ConfigurationError> {
        if requested.is_empty() {
            return Ok(self.topological_order());
        }
        let mut selected = HashSet::new();
        let mut frontier = Vec::new();
        for &stage in requested {
            if !self.contains(stage) {
                return Err(ConfigurationError::new(format!(
                    "stage '{stage}' is not declared in the pipeline"
                ))
                .with_stages(vec![stage.to_string()])
                .with_code("CONFIG-UNKNOWN-STAGE"));
            }
            frontier.push(stage);
        }
        while let Some(stage) = frontier.pop() {
            if selected.insert(stage) {
                frontier.extend(self.dependencies_of(stage));
            }
        }
        Ok(self.order_within(&selected))
    }

    fn order_within(&self, selected: &HashSet<StageName>) -> Vec<StageName> {
        let mut in_degree: HashMap<StageName, usize> = selected
            .iter()
            .map(|stage| {
                let count = self.dependencies[stage]
                    .iter()
                    .filter(|dep| selected.contains(dep))
                    .count();
                (*stage, count)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(stage, _)| Reverse(self.index[stage]))
            .collect();

        let mut order = Vec::with_capacity(selected.len());
        while let Some(Reverse(i)) = ready.pop() {
            let stage = self.definitions[i].name;
            order.push(stage);
            for def in &self.definitions {
                if !self.dependencies[&def.name].contains(&stage) {
                    continue;
                }
                if let Some(count) = in_degree.get_mut(&def.name) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(self.index[&def.name]));
                    }
                }
            }
        }
        order
    }

    fn find_cycle(&self) -> Option<Vec<StageName>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        for def in &self.definitions {
            if !visited.contains(&def.name) {
                if let Some(cycle) = self.dfs_cycle(def.name, &mut visited, &mut rec_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: StageName,
        visited: &mut HashSet<StageName>,
        rec_stack: &mut HashSet<StageName>,
        path: &mut Vec<StageName>,
    ) -> Option<Vec<StageName>> {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        for &dep in &self.dependencies[&node] {
            if !visited.contains(&dep) {
                if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(&dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
        }

        path.pop();
        rec_stack.remove(&node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use StageName::*;

    #[test]
    fn test_standard_order_is_declaration_order() {
        let graph = PipelineGraph::standard();
        assert_eq!(
            graph.topological_order(),
            vec![Generate, Optimize, Mitigate, Validate, Simulate, Analyze, Test]
        );
    }

    #[test]
    fn test_order_is_deterministic() {
        let graph = PipelineGraph::standard();
        let first = graph.topological_order();
        for _ in 0..20 {
            assert_eq!(graph.topological_order(), first);
        }
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        // Test and validate are declared before optimize here.
        let graph = PipelineGraph::new(vec![
            StageDefinition::new(Generate).with_source().output("ir/base"),
            StageDefinition::new(Validate).input("ir/base").output("results/validation"),
            StageDefinition::new(Optimize).input("ir/base").output("ir/optimized"),
        ])
        .unwrap();
        assert_eq!(graph.topological_order(), vec![Generate, Validate, Optimize]);
    }

    #[test]
    fn test_dependencies() {
        let graph = PipelineGraph::standard();
        assert!(graph.dependencies_of(Generate).is_empty());
        assert_eq!(
            graph.dependencies_of(Simulate),
            BTreeSet::from([Generate, Optimize])
        );
        assert_eq!(
            graph.dependents_of(Optimize),
            BTreeSet::from([Mitigate, Simulate, Analyze, Test])
        );
        assert!(graph.dependents_of(Analyze).is_empty());
    }

    #[test]
    fn test_order_for_includes_transitive_dependencies() {
        let graph = PipelineGraph::standard();
        assert_eq!(graph.order_for(&[Analyze]).unwrap(), vec![Generate, Optimize, Simulate, Analyze]);
        assert_eq!(graph.order_for(&[Optimize, Generate]).unwrap(), vec![Generate, Optimize]);
        assert_eq!(graph.order_for(&[]).unwrap().len(), 7);
    }

    #[test]
    fn test_order_for_unknown_stage() {
        let graph = PipelineGraph::new(vec![StageDefinition::new(Generate)
            .with_source()
            .output("ir/base")])
        .unwrap();
        let err = graph.order_for(&[Simulate]).unwrap_err();
        assert_eq!(err.code, "CONFIG-UNKNOWN-STAGE");
    }

    #[test]
    fn test_cycle_detected_at_load_time() {
        let err = PipelineGraph::new(vec![
            StageDefinition::new(Optimize).input("ir/simulated").output("ir/optimized"),
            StageDefinition::new(Simulate).input("ir/optimized").output("ir/simulated"),
        ])
        .unwrap_err();
        assert_eq!(err.code, "CONFIG-CYCLE");
        assert_eq!(err.stages, vec!["optimize", "simulate", "optimize"]);
    }

    #[test]
    fn test_self_cycle() {
        let err = PipelineGraph::new(vec![StageDefinition::new(Optimize)
            .input("ir/optimized")
            .output("ir/optimized")])
        .unwrap_err();
        assert_eq!(err.code, "CONFIG-CYCLE");
    }

    #[test]
    fn test_duplicate_stage_and_producer() {
        let err = PipelineGraph::new(vec![
            StageDefinition::new(Generate).output("ir/base"),
            StageDefinition::new(Generate).output("ir/other"),
        ])
        .unwrap_err();
        assert_eq!(err.code, "CONFIG-DUPLICATE-STAGE");

        let err = PipelineGraph::new(vec![
            StageDefinition::new(Generate).output("ir/base"),
            StageDefinition::new(Optimize).output("ir/base"),
        ])
        .unwrap_err();
        assert_eq!(err.code, "CONFIG-DUPLICATE-PRODUCER");
    }

    #[test]
    fn test_unknown_producer() {
        let err = PipelineGraph::new(vec![StageDefinition::new(Optimize)
            .input("ir/base")
            .output("ir/optimized")])
        .unwrap_err();
        assert_eq!(err.code, "CONFIG-UNKNOWN-PRODUCER");
    }

    #[test]
    fn test_from_json() {
        let graph = PipelineGraph::from_json_str(
            r#"{"stages": [
                {"name": "generate", "consumes_source": true, "outputs": ["ir/base"]},
                {"name": "simulate", "inputs": ["ir/base"], "outputs": ["results/simulation/base"],
                 "idempotent": false}
            ]}"#,
        )
        .unwrap();
        assert_eq!(graph.topological_order(), vec![Generate, Simulate]);
        assert!(!graph.definition(Simulate).unwrap().idempotent);
        assert!(graph.definition(Generate).unwrap().idempotent);
        assert_eq!(
            graph.producer_of(&ArtifactCategory::new("ir/base").unwrap()),
            Some(Generate)
        );
    }

    #[test]
    fn test_from_json_rejects_bad_category() {
        let err = PipelineGraph::from_json_str(
            r#"{"stages": [{"name": "generate", "outputs": ["../escape"]}]}"#,
        )
        .unwrap_err();
        assert!(err.message.contains("invalid pipeline document"));
    }
}
