pub mod backend;
pub mod breaker;
pub mod chain;
pub mod invoker;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod schema;

pub use backend::{FunctionBackend, RestBackend};
pub use breaker::{BreakerState, CircuitBreaker};
pub use chain::{ChainErrorMode, ChainOptions, ChainResult, ChainStep, ChainStrategy, ToolChainExecutor};
pub use invoker::ToolInvoker;
pub use metrics::{ToolMetrics, ToolStats};
pub use registry::ToolRegistry;
pub use retry::RetryPolicy;
