use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{AgentReply, SessionId, ToolCallContext, ToolKind, ToolSpec};

/// Agent invocation — the external capability that turns a prompt into text.
///
/// The engine never generates agent output itself; it hands the node input
/// to an implementation of this trait and consumes the reply.
pub trait AgentInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        agent_id: String,
        input: serde_json::Value,
        session: SessionId,
    ) -> BoxFuture<'_, Result<AgentReply>>;
}

/// Tool backend — executes one tool call of a given kind.
///
/// One backend is registered per `ToolKind`; the invoker dispatches to it
/// through this contract and never embeds the backend's implementation.
pub trait ToolBackend: Send + Sync + 'static {
    /// The kind of tool this backend serves.
    fn kind(&self) -> ToolKind;

    /// Execute the call. The returned value is the tool output payload.
    fn call(
        &self,
        spec: ToolSpec,
        input: serde_json::Value,
        ctx: ToolCallContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}
