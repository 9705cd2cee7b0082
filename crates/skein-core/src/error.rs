use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkeinError {
    // Graph / definition errors
    #[error("Workflow validation failed: {0}")]
    Validation(String),

    #[error("Workflow contains a cycle: {0}")]
    CycleDetected(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool is inactive: {0}")]
    ToolInactive(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Circuit breaker open for tool: {tool}")]
    BreakerOpen { tool: String },

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("No backend registered for tool kind: {0}")]
    BackendMissing(String),

    // Agent errors
    #[error("Agent execution failed: {agent}: {message}")]
    AgentExecution { agent: String, message: String },

    // Node errors
    #[error("Node execution failed: {node}: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Expression parse error: {0}")]
    ExpressionParse(String),

    #[error("Human input timed out for node: {node}")]
    HumanInputTimeout { node: String },

    // Run errors
    #[error("Run cancelled")]
    Cancelled,

    #[error("Run timed out after {0}s")]
    RunTimeout(u64),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SkeinError>;
