pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod graph;
pub mod human_input;
pub mod hybrid;

pub use context::ExecutionContext;
pub use coordinator::{
    DefinitionStore, HistoryFilter, InMemoryDefinitionStore, RunOptions, RunSummary,
    WorkflowCoordinator, WorkflowRun,
};
pub use dispatcher::NodeDispatcher;
pub use graph::{
    Edge, ErrorMode, ExecutionSettings, HybridStrategy, Node, NodeKind, Transform,
    WorkflowDefinition,
};
pub use human_input::{HumanInputBroker, HumanRequest, HumanResponse};
pub use hybrid::{parse_tool_plan, HybridExecutor, PlanParseError, ToolPlan};
