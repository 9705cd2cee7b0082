use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use skein_core::config::RunConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::expr;
use skein_core::traits::AgentInvoker;
use skein_core::types::{
    NodeExecutionRecord, NodeStatus, ResourceUsage, RunId, SessionId, ToolCallContext,
};
use skein_tools::retry::RetryPolicy;
use skein_tools::ToolInvoker;

use crate::context::ExecutionContext;
use crate::graph::definition::{Node, NodeKind, Transform};
use crate::human_input::{HumanInputBroker, HumanRequest};
use crate::hybrid::HybridExecutor;

/// What a node behavior produced.
struct Outcome {
    output: serde_json::Value,
    skipped: bool,
    network_calls: u32,
}

impl Outcome {
    fn completed(output: serde_json::Value) -> Self {
        Self {
            output,
            skipped: false,
            network_calls: 0,
        }
    }

    fn skipped(output: serde_json::Value) -> Self {
        Self {
            output,
            skipped: true,
            network_calls: 0,
        }
    }

    fn with_calls(mut self, network_calls: u32) -> Self {
        self.network_calls = network_calls;
        self
    }
}

/// Routes a node to the behavior for its kind and produces its
/// execution record. One match arm per `NodeKind` variant: adding a node
/// type is a compile-time exhaustiveness requirement here.
pub struct NodeDispatcher {
    agent: Arc<dyn AgentInvoker>,
    invoker: Arc<ToolInvoker>,
    hybrid: HybridExecutor,
    human: Arc<HumanInputBroker>,
    run_config: RunConfig,
}

impl NodeDispatcher {
    pub fn new(
        agent: Arc<dyn AgentInvoker>,
        invoker: Arc<ToolInvoker>,
        human: Arc<HumanInputBroker>,
        run_config: RunConfig,
    ) -> Self {
        let hybrid = HybridExecutor::new(agent.clone(), invoker.clone());
        Self {
            agent,
            invoker,
            hybrid,
            human,
            run_config,
        }
    }

    /// Execute one node: `Pending → Running → {Completed|Failed|Skipped}`.
    ///
    /// When `retry` is set (run error mode `retry`), a failing behavior
    /// is re-run with the policy's delays before the node counts as
    /// failed.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        run_id: &RunId,
        session: &SessionId,
        node: &Node,
        input: serde_json::Value,
        ctx: &mut ExecutionContext,
        tool_ctx: &ToolCallContext,
        retry: Option<&RetryPolicy>,
        max_concurrency: usize,
    ) -> NodeExecutionRecord {
        let started = Instant::now();
        let mut record = NodeExecutionRecord::pending(&node.id);
        record.status = NodeStatus::Running;
        record.input = Some(input.clone());
        record.started_at = Some(Utc::now());
        let memory_bytes = process_memory_bytes();

        let mut attempt = 0u32;
        let result = loop {
            let run_node_fut: futures::future::BoxFuture<'_, Result<Outcome>> = Box::pin(
                self.run_node(run_id, session, node, input.clone(), ctx, tool_ctx, max_concurrency),
            );
            match run_node_fut.await {
                Ok(outcome) => break Ok(outcome),
                Err(err) => {
                    let Some(policy) = retry else { break Err(err) };
                    if attempt >= policy.max_retries || matches!(err, SkeinError::Cancelled) {
                        break Err(err);
                    }
                    let delay = policy.delay_for(attempt);
                    warn!(
                        node_id = %node.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Node failed, retrying per run policy"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        record.retry_count = attempt;
        record.finished_at = Some(Utc::now());
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (network_calls, payload_bytes) = match &result {
            Ok(outcome) => (
                outcome.network_calls,
                serde_json::to_vec(&outcome.output)
                    .map(|b| b.len() as u64)
                    .unwrap_or(0),
            ),
            Err(_) => (0, 0),
        };
        record.usage = ResourceUsage {
            elapsed_ms,
            memory_bytes,
            network_calls,
            payload_bytes,
        };

        match result {
            Ok(outcome) => {
                record.status = if outcome.skipped {
                    NodeStatus::Skipped
                } else {
                    NodeStatus::Completed
                };
                if !outcome.skipped {
                    ctx.remember_node(&node.id, outcome.output.clone());
                }
                record.output = Some(outcome.output);
            }
            Err(err) => {
                debug!(node_id = %node.id, error = %err, "Node failed");
                record.status = NodeStatus::Failed;
                record.error = Some(err.to_string());
            }
        }
        record
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_node(
        &self,
        run_id: &RunId,
        session: &SessionId,
        node: &Node,
        input: serde_json::Value,
        ctx: &mut ExecutionContext,
        tool_ctx: &ToolCallContext,
        max_concurrency: usize,
    ) -> Result<Outcome> {
        match &node.kind {
            NodeKind::Agent { agent_id } => {
                let fut: futures::future::BoxFuture<'_, Result<Outcome>> =
                    Box::pin(self.run_agent(agent_id, input, session, ctx));
                fut.await
            }
            NodeKind::Tool { tool_id } => {
                let fut: futures::future::BoxFuture<'_, Result<Outcome>> =
                    Box::pin(self.run_tool(tool_id, input, tool_ctx, ctx));
                fut.await
            }
            NodeKind::Hybrid {
                agent_id,
                tool_ids,
                strategy,
            } => {
                let hybrid_fut: futures::future::BoxFuture<'_, Result<crate::hybrid::HybridOutput>> =
                    Box::pin(self.hybrid.execute(
                        agent_id,
                        tool_ids,
                        *strategy,
                        &input,
                        session,
                        tool_ctx,
                        max_concurrency,
                    ));
                let result = hybrid_fut.await?;
                ctx.set_agent_state(
                    agent_id,
                    json!({
                        "content": result.content,
                        "input_tokens": result.input_tokens,
                        "output_tokens": result.output_tokens,
                    }),
                );
                let calls = result.network_calls;
                Ok(Outcome::completed(result.output).with_calls(calls))
            }
            NodeKind::Condition { expr } => self.run_condition(&node.id, expr, &input, ctx),
            NodeKind::Loop {
                condition,
                max_iterations,
                body,
            } => self.run_loop(condition, *max_iterations, body.as_ref(), &input, ctx),
            NodeKind::HumanInput {
                prompt,
                input_type,
                timeout_secs,
                required,
                assignee,
            } => {
                let fut: futures::future::BoxFuture<'_, Result<Outcome>> =
                    Box::pin(self.run_human_input(
                        run_id,
                        &node.id,
                        prompt,
                        *input_type,
                        *timeout_secs,
                        *required,
                        assignee.clone(),
                        ctx,
                    ));
                fut.await
            }
            NodeKind::Transformer { transform } => {
                let output = apply_transform(transform, &input, ctx.variables())?;
                Ok(Outcome::completed(output))
            }
        }
    }

    async fn run_agent(
        &self,
        agent_id: &str,
        input: serde_json::Value,
        session: &SessionId,
        ctx: &mut ExecutionContext,
    ) -> Result<Outcome> {
        let reply = self
            .agent
            .invoke(agent_id.to_string(), input, session.clone())
            .await
            .map_err(|e| SkeinError::AgentExecution {
                agent: agent_id.to_string(),
                message: e.to_string(),
            })?;

        let state = json!({
            "content": reply.content,
            "input_tokens": reply.input_tokens,
            "output_tokens": reply.output_tokens,
        });
        ctx.set_agent_state(agent_id, state.clone());
        Ok(Outcome::completed(state).with_calls(1))
    }

    async fn run_tool(
        &self,
        tool_id: &str,
        input: serde_json::Value,
        tool_ctx: &ToolCallContext,
        ctx: &mut ExecutionContext,
    ) -> Result<Outcome> {
        let record = self.invoker.execute(tool_id, input, tool_ctx.clone()).await?;
        let calls = record.usage.network_calls;
        if record.succeeded() {
            let output = record.output.unwrap_or(serde_json::Value::Null);
            ctx.set_tool_state(tool_id, output.clone());
            Ok(Outcome::completed(output).with_calls(calls))
        } else {
            Err(SkeinError::ToolExecution {
                tool: tool_id.to_string(),
                message: record.error.unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }

    /// A condition node is never itself a failure unless the expression
    /// cannot be parsed.
    fn run_condition(
        &self,
        node_id: &str,
        expr_text: &str,
        input: &serde_json::Value,
        ctx: &mut ExecutionContext,
    ) -> Result<Outcome> {
        let mut scope = ctx.variables().clone();
        scope.extend(expr::scope_from_value(input));
        let result = expr::evaluate(expr_text, &scope)?;
        ctx.set_variable(format!("{}_result", node_id), json!(result));
        Ok(Outcome::completed(json!({ "result": result })))
    }

    /// Bounded iteration while the condition holds. A condition that
    /// fails to evaluate terminates the loop instead of failing the node;
    /// reaching the cap completes the node with `completed: false`.
    fn run_loop(
        &self,
        condition: &str,
        max_iterations: u32,
        body: Option<&Transform>,
        input: &serde_json::Value,
        ctx: &mut ExecutionContext,
    ) -> Result<Outcome> {
        let mut results = Vec::new();
        let mut current = input.clone();
        let mut iterations = 0u32;
        let mut completed = false;
        let mut condition_error = None;

        while iterations < max_iterations {
            let mut scope = ctx.variables().clone();
            scope.extend(expr::scope_from_value(&current));
            scope.insert("iteration".to_string(), json!(iterations));

            match expr::evaluate(condition, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    completed = true;
                    break;
                }
                Err(err) => {
                    debug!(error = %err, "Loop condition failed to evaluate, terminating loop");
                    condition_error = Some(err.to_string());
                    completed = true;
                    break;
                }
            }

            let value = match body {
                Some(transform) => apply_transform(transform, &current, ctx.variables())?,
                None => current.clone(),
            };
            results.push(value.clone());
            current = value;
            iterations += 1;
        }

        let mut output = serde_json::Map::new();
        output.insert("iterations".to_string(), json!(iterations));
        output.insert("results".to_string(), json!(results));
        output.insert("completed".to_string(), json!(completed));
        output.insert("cap_reached".to_string(), json!(!completed));
        if let Some(err) = condition_error {
            output.insert("condition_error".to_string(), json!(err));
        }
        Ok(Outcome::completed(serde_json::Value::Object(output)))
    }

    /// Suspend on the broker until a matching response or the timeout,
    /// whichever comes first; the loser of the race is cancelled.
    #[allow(clippy::too_many_arguments)]
    async fn run_human_input(
        &self,
        run_id: &RunId,
        node_id: &str,
        prompt: &str,
        input_type: crate::graph::definition::HumanInputKind,
        timeout_secs: Option<u64>,
        required: bool,
        assignee: Option<String>,
        ctx: &mut ExecutionContext,
    ) -> Result<Outcome> {
        let timeout_secs = timeout_secs.unwrap_or(self.run_config.human_input_timeout_secs);
        ctx.mark_pending_input(node_id);

        let rx = self
            .human
            .request(HumanRequest {
                run_id: run_id.clone(),
                node_id: node_id.to_string(),
                prompt: prompt.to_string(),
                input_type,
                timeout_secs,
                assignee,
                requested_at: Utc::now(),
            })
            .await;

        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await;
        ctx.resolve_pending_input(node_id);

        match result {
            Ok(Ok(response)) => Ok(Outcome::completed(json!({
                "value": response.value,
                "responder_id": response.responder_id,
                "responded_at": response.responded_at.to_rfc3339(),
            }))),
            // Sender dropped (run cancelled) or timeout elapsed
            Ok(Err(_)) | Err(_) => {
                self.human.cancel(run_id, node_id).await;
                if required {
                    Err(SkeinError::HumanInputTimeout {
                        node: node_id.to_string(),
                    })
                } else {
                    Ok(Outcome::skipped(json!({
                        "skipped": true,
                        "reason": "timeout",
                    })))
                }
            }
        }
    }
}

/// Apply a declared transform to a value.
fn apply_transform(
    transform: &Transform,
    input: &serde_json::Value,
    variables: &HashMap<String, serde_json::Value>,
) -> Result<serde_json::Value> {
    match transform {
        Transform::Path { path } => {
            let path = path.trim();
            if path.is_empty() || path == "$" {
                return Ok(input.clone());
            }
            Ok(expr::resolve_path(input, path)
                .cloned()
                .unwrap_or(serde_json::Value::Null))
        }
        Transform::Template { template } => {
            Ok(serde_json::Value::String(render_template(
                template, input, variables,
            )))
        }
        Transform::Expr { expr: expression } => {
            let mut scope = variables.clone();
            scope.extend(expr::scope_from_value(input));
            let result = expr::evaluate(expression, &scope)?;
            Ok(serde_json::Value::Bool(result))
        }
    }
}

/// Replace `{{key}}` placeholders from the input (dot paths allowed),
/// falling back to run variables. Unresolvable keys render empty.
fn render_template(
    template: &str,
    input: &serde_json::Value,
    variables: &HashMap<String, serde_json::Value>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        let value = expr::resolve_path(input, key)
            .or_else(|| variables.get(key))
            .cloned();
        match value {
            Some(serde_json::Value::String(s)) => out.push_str(&s),
            Some(other) => out.push_str(&other.to_string()),
            None => {}
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Resident set size snapshot, in bytes. Zero where unavailable.
fn process_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
            {
                return pages * 4096;
            }
        }
    }
    0
}
