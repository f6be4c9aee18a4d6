use crate::error::{DefinitionError, ReferenceKind};
use crate::nodes::CONDITION;
use crate::types::{NodeDefinition, WorkflowDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

/// Check the structural invariants of a definition.
///
/// Order: non-empty, start node, `next_nodes`/`on_error` references,
/// condition branches, then duplicate ids.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if definition.nodes.is_empty() {
        return Err(DefinitionError::EmptyWorkflow(definition.id.clone()));
    }

    let node_ids: HashSet<&str> = definition.nodes.iter().map(|n| n.id.as_str()).collect();

    if !node_ids.contains(definition.start_node.as_str()) {
        return Err(DefinitionError::MissingStartNode(
            definition.start_node.clone(),
        ));
    }

    for node in &definition.nodes {
        for next in &node.next_nodes {
            if !node_ids.contains(next.as_str()) {
                return Err(DefinitionError::UnknownReference {
                    node_id: node.id.clone(),
                    target: next.clone(),
                    kind: ReferenceKind::NextNode,
                });
            }
        }

        if let Some(handler) = &node.on_error {
            if !node_ids.contains(handler.as_str()) {
                return Err(DefinitionError::UnknownReference {
                    node_id: node.id.clone(),
                    target: handler.clone(),
                    kind: ReferenceKind::ErrorHandler,
                });
            }
        }

        for branch in condition_branches(node) {
            if !node_ids.contains(branch) {
                return Err(DefinitionError::UnknownBranch {
                    node_id: node.id.clone(),
                    target: branch.to_string(),
                });
            }
        }
    }

    if node_ids.len() != definition.nodes.len() {
        let mut seen = HashSet::new();
        for node in &definition.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(DefinitionError::DuplicateNodeId(node.id.clone()));
            }
        }
    }

    Ok(())
}

/// `true_branch`/`false_branch` targets of a condition node
fn condition_branches(node: &NodeDefinition) -> impl Iterator<Item = &str> {
    let is_condition = node.node_type == CONDITION;
    ["true_branch", "false_branch"]
        .into_iter()
        .filter_map(move |key| {
            if is_condition {
                node.config.get(key).and_then(|v| v.as_str())
            } else {
                None
            }
        })
}

/// Directed view of every edge a run could follow
pub struct WorkflowGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    start: Option<NodeIndex>,
}

impl WorkflowGraph {
    /// Build from a definition. Dangling references are skipped.
    pub fn from_definition(definition: &WorkflowDefinition) -> Self {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for node in &definition.nodes {
            indices
                .entry(node.id.clone())
                .or_insert_with(|| graph.add_node(node.id.clone()));
        }

        for node in &definition.nodes {
            let from = indices[&node.id];
            let targets = node
                .next_nodes
                .iter()
                .map(String::as_str)
                .chain(node.on_error.as_deref())
                .chain(condition_branches(node));

            for target in targets {
                if let Some(&to) = indices.get(target) {
                    graph.update_edge(from, to, ());
                }
            }
        }

        let start = indices.get(&definition.start_node).copied();
        Self {
            graph,
            indices,
            start,
        }
    }

    /// Node ids reachable from the start node, in DFS order
    pub fn reachable(&self) -> Vec<String> {
        let Some(start) = self.start else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut ids = Vec::new();
        while let Some(index) = dfs.next(&self.graph) {
            ids.push(self.graph[index].clone());
        }
        ids
    }

    /// Node ids that no run can reach, sorted
    pub fn unreachable(&self) -> Vec<String> {
        let reachable: HashSet<String> = self.reachable().into_iter().collect();
        let mut ids: Vec<String> = self
            .indices
            .keys()
            .filter(|id| !reachable.contains(*id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Whether the graph contains a cycle; cycles are bounded by the iteration cap
    pub fn has_cycle(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }
}

/// Non-fatal findings about a valid definition. Callers decide how to report them.
pub fn lint_definition(definition: &WorkflowDefinition) -> Vec<String> {
    let graph = WorkflowGraph::from_definition(definition);
    let mut warnings: Vec<String> = graph
        .unreachable()
        .into_iter()
        .map(|id| format!("Node '{}' is unreachable from start node '{}'", id, definition.start_node))
        .collect();

    if graph.has_cycle() {
        warnings.push(
            "Workflow graph contains a cycle; nodes already executed are not run again".to_string(),
        );
    }

    warnings
}
