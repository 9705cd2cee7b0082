use std::collections::HashMap;

use skein_core::error::{Result, SkeinError};
use skein_core::expr;
use skein_core::types::{NodeExecutionRecord, NodeStatus};

use super::definition::{Edge, ErrorMode, WorkflowDefinition};

/// Whether a node may be dispatched given the current records.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// All upstream dependencies are satisfied.
    Ready,
    /// The node must be recorded as skipped (reason attached).
    Skip(String),
    /// An upstream dependency has no terminal record yet.
    Blocked,
}

/// Computes the topological execution order and admits nodes once their
/// upstream dependencies have completed.
pub struct DependencyScheduler {
    order: Vec<String>,
    incoming: HashMap<String, Vec<Edge>>,
}

impl DependencyScheduler {
    /// Build the scheduler for a validated definition. A cycle here is a
    /// hard error (the validator reports it first in normal flow).
    pub fn new(def: &WorkflowDefinition) -> Result<Self> {
        let mut incoming: HashMap<String, Vec<Edge>> = HashMap::new();
        let mut dependencies: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &def.nodes {
            incoming.insert(node.id.clone(), Vec::new());
            dependencies.insert(node.id.as_str(), Vec::new());
        }
        for edge in &def.edges {
            if let Some(edges) = incoming.get_mut(&edge.target) {
                edges.push(edge.clone());
            }
            if let Some(deps) = dependencies.get_mut(edge.target.as_str()) {
                deps.push(edge.source.as_str());
            }
        }

        // Dependency-first depth-first traversal: a node's dependencies
        // all appear before it.
        let mut order = Vec::with_capacity(def.nodes.len());
        let mut state: HashMap<&str, u8> = HashMap::new(); // 0 unvisited, 1 visiting, 2 done
        for node in &def.nodes {
            Self::visit(node.id.as_str(), &dependencies, &mut state, &mut order)?;
        }

        Ok(Self { order, incoming })
    }

    fn visit<'a>(
        node: &'a str,
        dependencies: &HashMap<&'a str, Vec<&'a str>>,
        state: &mut HashMap<&'a str, u8>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match state.get(node).copied().unwrap_or(0) {
            2 => return Ok(()),
            1 => return Err(SkeinError::CycleDetected(node.to_string())),
            _ => {}
        }
        state.insert(node, 1);
        for &dep in dependencies.get(node).into_iter().flatten() {
            Self::visit(dep, dependencies, state, order)?;
        }
        state.insert(node, 2);
        order.push(node.to_string());
        Ok(())
    }

    /// The topological execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Direct dependency ids of a node.
    pub fn dependencies(&self, node_id: &str) -> Vec<&str> {
        self.incoming
            .get(node_id)
            .map(|edges| edges.iter().map(|e| e.source.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn is_entry(&self, node_id: &str) -> bool {
        self.incoming.get(node_id).map_or(true, |e| e.is_empty())
    }

    /// Decide whether a node may run.
    ///
    /// A node is eligible exactly when every dependency's record is
    /// `Completed` (and its edge condition, if any, holds against the
    /// source output). A failed dependency skips the node unless the
    /// run's error mode is `continue`, which only requires the
    /// dependencies that did complete. A node whose every upstream branch
    /// is inactive (skipped sources or false edge conditions) is skipped.
    pub fn admit(
        &self,
        node_id: &str,
        records: &HashMap<String, NodeExecutionRecord>,
        error_mode: ErrorMode,
        variables: &HashMap<String, serde_json::Value>,
    ) -> Admission {
        let Some(edges) = self.incoming.get(node_id) else {
            return Admission::Skip(format!("unknown node '{}'", node_id));
        };
        if edges.is_empty() {
            return Admission::Ready;
        }

        let mut active = 0usize;
        let mut failed_dep = false;

        for edge in edges {
            let Some(record) = records.get(&edge.source) else {
                return Admission::Blocked;
            };
            match record.status {
                NodeStatus::Pending | NodeStatus::Running => return Admission::Blocked,
                NodeStatus::Completed => {
                    if edge_active(edge, record, variables) {
                        active += 1;
                    }
                }
                NodeStatus::Failed => failed_dep = true,
                NodeStatus::Skipped => {}
            }
        }

        if failed_dep && error_mode != ErrorMode::Continue {
            return Admission::Skip("upstream dependency failed".to_string());
        }
        if active == 0 {
            return Admission::Skip("no active upstream branch".to_string());
        }
        Admission::Ready
    }

    /// Build a node's input: entry nodes take the run's top-level input;
    /// everything else aggregates completed predecessor outputs. A single
    /// active predecessor passes its output through directly; multiple
    /// predecessors are keyed by predecessor id.
    pub fn gather_input(
        &self,
        node_id: &str,
        records: &HashMap<String, NodeExecutionRecord>,
        run_input: &serde_json::Value,
        variables: &HashMap<String, serde_json::Value>,
    ) -> serde_json::Value {
        let Some(edges) = self.incoming.get(node_id) else {
            return run_input.clone();
        };
        if edges.is_empty() {
            return run_input.clone();
        }

        let mut contributions: Vec<(&str, serde_json::Value)> = Vec::new();
        for edge in edges {
            if let Some(record) = records.get(&edge.source) {
                if record.status == NodeStatus::Completed && edge_active(edge, record, variables) {
                    contributions.push((
                        edge.source.as_str(),
                        record.output.clone().unwrap_or(serde_json::Value::Null),
                    ));
                }
            }
        }

        match contributions.len() {
            0 => serde_json::Value::Null,
            1 => contributions.remove(0).1,
            _ => {
                let mut map = serde_json::Map::new();
                for (source, output) in contributions {
                    map.insert(source.to_string(), output);
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

/// An edge is active when it has no condition or its condition holds
/// against the source output merged with the run variables.
fn edge_active(
    edge: &Edge,
    source_record: &NodeExecutionRecord,
    variables: &HashMap<String, serde_json::Value>,
) -> bool {
    let Some(condition) = &edge.condition else {
        return true;
    };
    let mut scope = variables.clone();
    if let Some(output) = &source_record.output {
        scope.extend(expr::scope_from_value(output));
        scope.insert("output".to_string(), output.clone());
    }
    expr::evaluate_or_false(condition, &scope)
}
