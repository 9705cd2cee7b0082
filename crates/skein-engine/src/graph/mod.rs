pub mod definition;
pub mod scheduler;
pub mod validator;

pub use definition::{
    Edge, ErrorMode, ExecutionSettings, HumanInputKind, HybridStrategy, Node, NodeKind, Transform,
    WorkflowDefinition,
};
pub use scheduler::{Admission, DependencyScheduler};
pub use validator::{validate, ValidationReport};
