use std::collections::{HashMap, HashSet};

use super::definition::{NodeKind, Transform, WorkflowDefinition};

/// Outcome of validating a (possibly partial) workflow definition.
///
/// A definition with any hard error must not be scheduled; warnings are
/// advisory for authoring tools.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Validate a workflow definition: graph shape, cycles, and per-kind
/// node configuration.
pub fn validate(def: &WorkflowDefinition) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if def.nodes.is_empty() {
        errors.push("workflow has no nodes".to_string());
        return ValidationReport::from_parts(errors, warnings);
    }

    // Node ids must be unique
    let mut seen = HashSet::new();
    for node in &def.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
    }

    // Every edge endpoint must refer to an existing node
    for edge in &def.edges {
        if !seen.contains(edge.source.as_str()) {
            errors.push(format!(
                "edge references unknown source node '{}'",
                edge.source
            ));
        }
        if !seen.contains(edge.target.as_str()) {
            errors.push(format!(
                "edge references unknown target node '{}'",
                edge.target
            ));
        }
    }

    // Disconnected nodes are a warning, not an error
    if def.nodes.len() > 1 {
        let mut connected = HashSet::new();
        for edge in &def.edges {
            connected.insert(edge.source.as_str());
            connected.insert(edge.target.as_str());
        }
        for node in &def.nodes {
            if !connected.contains(node.id.as_str()) {
                warnings.push(format!("node '{}' is not connected to any edge", node.id));
            }
        }
    }

    // Per-node-type configuration
    for node in &def.nodes {
        check_node_config(node, &mut errors);
    }

    // Cycle detection only makes sense on a structurally sound graph
    if errors.is_empty() {
        if let Some(cycle) = find_cycle(def) {
            errors.push(format!("cycle detected: {}", cycle.join(" -> ")));
        }
    }

    ValidationReport::from_parts(errors, warnings)
}

fn check_node_config(node: &super::definition::Node, errors: &mut Vec<String>) {
    match &node.kind {
        NodeKind::Agent { agent_id } => {
            if agent_id.is_empty() {
                errors.push(format!("agent node '{}' has no agent identifier", node.id));
            }
        }
        NodeKind::Tool { tool_id } => {
            if tool_id.is_empty() {
                errors.push(format!("tool node '{}' has no tool identifier", node.id));
            }
        }
        NodeKind::Hybrid {
            agent_id, tool_ids, ..
        } => {
            if agent_id.is_empty() {
                errors.push(format!("hybrid node '{}' has no agent identifier", node.id));
            }
            if tool_ids.is_empty() {
                errors.push(format!("hybrid node '{}' has an empty tool list", node.id));
            }
        }
        NodeKind::Condition { expr } => {
            if expr.trim().is_empty() {
                errors.push(format!("condition node '{}' has an empty expression", node.id));
            }
        }
        NodeKind::Loop {
            condition,
            max_iterations,
            ..
        } => {
            if condition.trim().is_empty() {
                errors.push(format!("loop node '{}' has an empty condition", node.id));
            }
            if *max_iterations == 0 {
                errors.push(format!("loop node '{}' has max_iterations 0", node.id));
            }
        }
        NodeKind::HumanInput { prompt, .. } => {
            if prompt.trim().is_empty() {
                errors.push(format!("human_input node '{}' has an empty prompt", node.id));
            }
        }
        NodeKind::Transformer { transform } => {
            let empty = match transform {
                Transform::Template { template } => template.is_empty(),
                Transform::Path { .. } => false, // empty path selects the whole input
                Transform::Expr { expr } => expr.trim().is_empty(),
            };
            if empty {
                errors.push(format!(
                    "transformer node '{}' has an empty transform",
                    node.id
                ));
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first cycle search with three-color marking. Returns the cycle
/// path if a back-edge to a gray node is found.
fn find_cycle(def: &WorkflowDefinition) -> Option<Vec<String>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &def.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut colors: HashMap<&str, Color> = def
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), Color::White))
        .collect();

    for node in &def.nodes {
        if colors[node.id.as_str()] == Color::White {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(node.id.as_str(), &adjacency, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'a>(
    node: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    colors: &mut HashMap<&'a str, Color>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    colors.insert(node, Color::Gray);
    stack.push(node);

    for &next in adjacency.get(node).into_iter().flatten() {
        match colors.get(next).copied().unwrap_or(Color::White) {
            // Back-edge into the current path: cycle
            Color::Gray => {
                let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.to_string());
                return Some(cycle);
            }
            Color::White => {
                if let Some(cycle) = visit(next, adjacency, colors, stack) {
                    return Some(cycle);
                }
            }
            Color::Black => {}
        }
    }

    stack.pop();
    colors.insert(node, Color::Black);
    None
}

#[cfg(test)]
mod tests {
    use super::super::definition::{HybridStrategy, Node, WorkflowDefinition};
    use super::*;

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Linear")
            .with_node(Node::tool("a", "tool_a"))
            .with_node(Node::tool("b", "tool_b"))
            .with_node(Node::tool("c", "tool_c"))
            .with_edge("a", "b")
            .with_edge("b", "c")
    }

    #[test]
    fn valid_linear_graph() {
        let report = validate(&linear());
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn cycle_is_hard_error() {
        let def = linear().with_edge("c", "a");
        let report = validate(&def);
        assert!(!report.valid);
        assert!(report.errors[0].contains("cycle detected"));
    }

    #[test]
    fn self_loop_is_cycle() {
        let def = WorkflowDefinition::new("wf", "Self")
            .with_node(Node::tool("a", "tool_a"))
            .with_edge("a", "a");
        let report = validate(&def);
        assert!(!report.valid);
        assert!(report.errors[0].contains("cycle detected"));
    }

    #[test]
    fn disconnected_node_is_warning() {
        let def = linear().with_node(Node::tool("island", "tool_x"));
        let report = validate(&def);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("island"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let def = WorkflowDefinition::new("wf", "Dup")
            .with_node(Node::tool("a", "t1"))
            .with_node(Node::tool("a", "t2"));
        let report = validate(&def);
        assert!(!report.valid);
        assert!(report.errors[0].contains("duplicate node id"));
    }

    #[test]
    fn unknown_edge_endpoint_rejected() {
        let def = WorkflowDefinition::new("wf", "Bad")
            .with_node(Node::tool("a", "t1"))
            .with_edge("a", "ghost");
        let report = validate(&def);
        assert!(!report.valid);
        assert!(report.errors[0].contains("unknown target"));
    }

    #[test]
    fn missing_identifiers_rejected() {
        let def = WorkflowDefinition::new("wf", "Missing")
            .with_node(Node::agent("a", ""))
            .with_node(Node::tool("t", ""))
            .with_node(Node::hybrid("h", "", vec![], HybridStrategy::AgentFirst));
        let report = validate(&def);
        assert!(!report.valid);
        // agent id, tool id, hybrid agent id, hybrid tool list
        assert_eq!(report.errors.len(), 4);
    }

    #[test]
    fn empty_graph_rejected() {
        let report = validate(&WorkflowDefinition::new("wf", "Empty"));
        assert!(!report.valid);
    }

    #[test]
    fn single_node_no_disconnection_warning() {
        let def = WorkflowDefinition::new("wf", "One").with_node(Node::tool("only", "t"));
        let report = validate(&def);
        assert!(report.valid);
        assert!(report.warnings.is_empty());
    }
}
