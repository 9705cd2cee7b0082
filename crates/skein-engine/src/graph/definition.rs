use serde::{Deserialize, Serialize};

use skein_core::config::RetryConfig;

/// An immutable workflow graph: nodes, edges, triggers, and execution
/// settings. Definitions arrive as JSON and are validated before any run
/// is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub settings: ExecutionSettings,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            triggers: Vec::new(),
            settings: ExecutionSettings::default(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }

    pub fn with_conditional_edge(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.edges.push(Edge::new(source, target).when(condition));
        self
    }

    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// One unit of work in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    fn with_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
        }
    }

    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Agent {
                agent_id: agent_id.into(),
            },
        )
    }

    pub fn tool(id: impl Into<String>, tool_id: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Tool {
                tool_id: tool_id.into(),
            },
        )
    }

    pub fn hybrid(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        tool_ids: Vec<String>,
        strategy: HybridStrategy,
    ) -> Self {
        Self::with_kind(
            id,
            NodeKind::Hybrid {
                agent_id: agent_id.into(),
                tool_ids,
                strategy,
            },
        )
    }

    pub fn condition(id: impl Into<String>, expr: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Condition { expr: expr.into() })
    }

    pub fn repeat(id: impl Into<String>, condition: impl Into<String>, max_iterations: u32) -> Self {
        Self::with_kind(
            id,
            NodeKind::Loop {
                condition: condition.into(),
                max_iterations,
                body: None,
            },
        )
    }

    pub fn human_input(id: impl Into<String>, prompt: impl Into<String>, required: bool) -> Self {
        Self::with_kind(
            id,
            NodeKind::HumanInput {
                prompt: prompt.into(),
                input_type: HumanInputKind::default(),
                timeout_secs: None,
                required,
                assignee: None,
            },
        )
    }

    pub fn transformer(id: impl Into<String>, transform: Transform) -> Self {
        Self::with_kind(id, NodeKind::Transformer { transform })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// The closed set of node behaviors. Adding a variant is a
/// compile-time-checked exhaustiveness requirement in the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Invoke the external agent capability.
    Agent { agent_id: String },
    /// Delegate to the tool invoker.
    Tool { tool_id: String },
    /// Combined agent + tool execution under one of four strategies.
    Hybrid {
        agent_id: String,
        tool_ids: Vec<String>,
        #[serde(default)]
        strategy: HybridStrategy,
    },
    /// Evaluate a boolean expression against input and run variables.
    Condition { expr: String },
    /// Bounded iteration while a condition holds.
    Loop {
        condition: String,
        #[serde(default = "default_loop_iterations")]
        max_iterations: u32,
        #[serde(default)]
        body: Option<Transform>,
    },
    /// Suspend until a matching response event or a timeout.
    HumanInput {
        prompt: String,
        #[serde(default)]
        input_type: HumanInputKind,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default = "default_required")]
        required: bool,
        #[serde(default)]
        assignee: Option<String>,
    },
    /// Apply a declared data transform to the node input.
    Transformer { transform: Transform },
}

fn default_loop_iterations() -> u32 {
    100
}
fn default_required() -> bool {
    true
}

/// Hybrid node strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridStrategy {
    /// Agent proposes a tool plan, tools execute, agent synthesizes.
    #[default]
    AgentFirst,
    /// Tools run first, their output feeds the agent.
    ToolFirst,
    /// Agent and tools run concurrently; results are combined.
    Parallel,
    /// Bidirectional exchange: plan, execute, review, final pass.
    Coordinated,
}

/// Expected shape of a human-input response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanInputKind {
    #[default]
    Text,
    Number,
    Boolean,
    Choice,
}

/// A declared data transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    /// `{{key}}` placeholders substituted from the input (and variables).
    Template { template: String },
    /// Dot-path extraction; `$` or empty selects the whole input.
    Path { path: String },
    /// Expression evaluation producing a boolean.
    Expr { expr: String },
}

impl Transform {
    pub fn template(template: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self::Path { path: path.into() }
    }

    pub fn expr(expr: impl Into<String>) -> Self {
        Self::Expr { expr: expr.into() }
    }
}

/// A directed edge. The optional condition is evaluated against the
/// source node's output; a false condition deactivates the branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// How node failures propagate through a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// First failed node aborts the run; the rest are skipped.
    #[default]
    Stop,
    /// Execution proceeds; failed nodes are recorded in the summary.
    Continue,
    /// The failing node is retried per the run's retry policy first.
    Retry,
}

/// Execution settings carried by a definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Wall-clock limit for one run; engine default applies when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Concurrency cap for parallel branches inside this run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub error_mode: ErrorMode,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_max_concurrency() -> usize {
    8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_builder() {
        let def = WorkflowDefinition::new("wf", "Test")
            .with_node(Node::tool("a", "tool_a"))
            .with_node(Node::tool("b", "tool_b"))
            .with_edge("a", "b");

        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.edges.len(), 1);
        assert!(def.node("a").is_some());
        assert!(def.node("z").is_none());
    }

    #[test]
    fn node_kind_serde_tagging() {
        let json = r#"{
            "id": "n1",
            "type": "hybrid",
            "agent_id": "researcher",
            "tool_ids": ["search", "fetch"],
            "strategy": "tool_first"
        }"#;
        let node: Node = serde_json::from_str(json).unwrap();
        match &node.kind {
            NodeKind::Hybrid {
                agent_id,
                tool_ids,
                strategy,
            } => {
                assert_eq!(agent_id, "researcher");
                assert_eq!(tool_ids.len(), 2);
                assert_eq!(*strategy, HybridStrategy::ToolFirst);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn loop_defaults() {
        let json = r#"{"id": "l", "type": "loop", "condition": "count < 10"}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        match &node.kind {
            NodeKind::Loop {
                max_iterations,
                body,
                ..
            } => {
                assert_eq!(*max_iterations, 100);
                assert!(body.is_none());
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn human_input_defaults_to_required() {
        let json = r#"{"id": "gate", "type": "human_input", "prompt": "Approve?"}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        match &node.kind {
            NodeKind::HumanInput {
                required,
                input_type,
                ..
            } => {
                assert!(*required);
                assert_eq!(*input_type, HumanInputKind::Text);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn definition_roundtrip() {
        let def = WorkflowDefinition::new("wf", "Roundtrip")
            .with_node(Node::condition("check", r#"status == "ok""#))
            .with_node(Node::transformer("extract", Transform::path("data.items")))
            .with_conditional_edge("check", "extract", "result");

        let json = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.edges[0].condition.as_deref(), Some("result"));
        assert_eq!(parsed.settings.error_mode, ErrorMode::Stop);
    }
}
