use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique session identifier, threaded into agent and tool calls.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a workflow run.
///
/// `Pending → Running → {Completed | Failed | Cancelled}`, with `Paused`
/// as a resumable detour from `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle status of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Dequeue priority for pending runs. Higher variants dequeue first;
/// ties break FIFO by submission order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::str::FromStr for Priority {
    type Err = crate::error::SkeinError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(crate::error::SkeinError::Config(format!(
                "Unknown priority: {}",
                other
            ))),
        }
    }
}

/// Resource counters recorded for every node execution and tool call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Wall-clock time spent.
    pub elapsed_ms: u64,
    /// Process memory snapshot at dispatch time.
    pub memory_bytes: u64,
    /// One unit per external call (retries count individually).
    pub network_calls: u32,
    /// Serialized size of the response payload.
    pub payload_bytes: u64,
}

/// Per-node outcome within a run. Immutable once `status` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub status: NodeStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default)]
    pub usage: ResourceUsage,
}

impl NodeExecutionRecord {
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            input: None,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            usage: ResourceUsage::default(),
        }
    }
}

/// Record of one tool invocation, standalone or as part of a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub id: String,
    pub tool_id: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub status: NodeStatus,
    pub retry_count: u32,
    #[serde(default)]
    pub usage: ResourceUsage,
}

impl ToolInvocationRecord {
    pub fn success(
        tool_id: impl Into<String>,
        input: serde_json::Value,
        output: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_id: tool_id.into(),
            input,
            output: Some(output),
            error: None,
            status: NodeStatus::Completed,
            retry_count: 0,
            usage: ResourceUsage::default(),
        }
    }

    pub fn failure(
        tool_id: impl Into<String>,
        input: serde_json::Value,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_id: tool_id.into(),
            input,
            output: None,
            error: Some(error.into()),
            status: NodeStatus::Failed,
            retry_count: 0,
            usage: ResourceUsage::default(),
        }
    }

    pub fn skipped(tool_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_id: tool_id.into(),
            input,
            output: None,
            error: None,
            status: NodeStatus::Skipped,
            retry_count: 0,
            usage: ResourceUsage::default(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == NodeStatus::Completed
    }
}

/// What the external agent capability returns from one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub content: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl AgentReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// Identifiers threaded into every backend call.
#[derive(Debug, Clone, Default)]
pub struct ToolCallContext {
    pub session_id: Option<SessionId>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
}

/// Kind of backend a tool dispatches to.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Function,
    Rest,
    Retrieval,
    Browser,
    Database,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Function => "function",
            Self::Rest => "rest",
            Self::Retrieval => "retrieval",
            Self::Browser => "browser",
            Self::Database => "database",
        };
        write!(f, "{}", s)
    }
}

/// Declaration of a callable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: ToolKind,
    #[serde(default = "default_active")]
    pub active: bool,
    /// JSON Schema the input must satisfy. Violations are terminal.
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    /// JSON Schema for the output. Violations are advisory only.
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    /// Kind-specific configuration (e.g. url/method for REST tools).
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_active() -> bool {
    true
}

impl ToolSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            kind,
            active: true,
            input_schema: None,
            output_schema: None,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn run_status_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn node_status_terminal() {
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
    }

    #[test]
    fn invocation_record_constructors() {
        let ok = ToolInvocationRecord::success("t1", serde_json::json!({}), serde_json::json!(1));
        assert!(ok.succeeded());

        let bad = ToolInvocationRecord::failure("t1", serde_json::json!({}), "boom");
        assert!(!bad.succeeded());
        assert_eq!(bad.error.as_deref(), Some("boom"));

        let skip = ToolInvocationRecord::skipped("t1", serde_json::json!({}));
        assert_eq!(skip.status, NodeStatus::Skipped);
    }

    #[test]
    fn tool_spec_serde() {
        let spec = ToolSpec::new("doubler", "Doubler", ToolKind::Function)
            .with_input_schema(serde_json::json!({"type": "object"}));
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: ToolSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "doubler");
        assert!(parsed.active);
        assert_eq!(parsed.kind, ToolKind::Function);
    }

    #[test]
    fn priority_from_str() {
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
