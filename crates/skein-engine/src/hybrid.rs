use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use skein_core::error::{Result, SkeinError};
use skein_core::traits::AgentInvoker;
use skein_core::types::{AgentReply, SessionId, ToolCallContext, ToolInvocationRecord};
use skein_tools::{ChainErrorMode, ChainOptions, ChainStep, ChainStrategy, ToolChainExecutor, ToolInvoker};

use crate::graph::definition::HybridStrategy;

/// An ordered tool plan extracted from free-form agent output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolPlan {
    pub steps: Vec<PlannedCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCall {
    pub tool_id: String,
    pub input: Option<serde_json::Value>,
}

/// Why a plan could not be extracted. The caller treats any parse
/// failure as an empty plan, never as a node failure: the upstream agent
/// output format is not contractually guaranteed.
#[derive(Debug, thiserror::Error)]
pub enum PlanParseError {
    #[error("no JSON payload in agent output")]
    NoJson,
    #[error("JSON payload is not a tool plan")]
    NotAPlan,
}

/// Extract a tool plan from agent text.
///
/// Accepts the whole text as JSON, a fenced ```json block, or the first
/// balanced JSON object/array embedded in prose. The plan itself is
/// either `{"steps": [...]}` (also accepted under `"plan"`/`"tools"`) or
/// a bare array; steps are strings or `{"tool_id", "input"}` objects.
pub fn parse_tool_plan(text: &str) -> std::result::Result<ToolPlan, PlanParseError> {
    let mut candidates: Vec<String> = Vec::new();

    let trimmed = text.trim();
    candidates.push(trimmed.to_string());

    if let Some(fenced) = extract_fenced(trimmed) {
        candidates.push(fenced);
    }
    if let Some(embedded) = extract_balanced(trimmed) {
        candidates.push(embedded);
    }

    let mut saw_json = false;
    for candidate in candidates {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&candidate) {
            saw_json = true;
            if let Some(plan) = plan_from_value(&value) {
                return Ok(plan);
            }
        }
    }

    if saw_json {
        Err(PlanParseError::NotAPlan)
    } else {
        Err(PlanParseError::NoJson)
    }
}

fn plan_from_value(value: &serde_json::Value) -> Option<ToolPlan> {
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => ["steps", "plan", "tools"]
            .iter()
            .find_map(|key| map.get(*key))?
            .as_array()?,
        _ => return None,
    };

    let steps = items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(tool_id) => Some(PlannedCall {
                tool_id: tool_id.clone(),
                input: None,
            }),
            serde_json::Value::Object(map) => {
                let tool_id = ["tool_id", "tool", "name"]
                    .iter()
                    .find_map(|key| map.get(*key))
                    .and_then(|v| v.as_str())?;
                Some(PlannedCall {
                    tool_id: tool_id.to_string(),
                    input: map.get("input").cloned(),
                })
            }
            _ => None,
        })
        .collect();

    Some(ToolPlan { steps })
}

fn extract_fenced(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')?;
    let body = &after[body_start + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

/// Find the first balanced `{...}` or `[...]` region, string-aware.
fn extract_balanced(text: &str) -> Option<String> {
    let start = text.find(|c| c == '{' || c == '[')?;
    let bytes: Vec<char> = text[start..].chars().collect();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(bytes[..=i].iter().collect());
                }
            }
            _ => {}
        }
    }
    None
}

/// Combined result of a hybrid node execution.
#[derive(Debug, Clone)]
pub struct HybridOutput {
    pub output: serde_json::Value,
    pub content: String,
    pub network_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Executes hybrid agent+tool strategies. Unplanned tool batches run
/// through the chain executor; planned calls carry their own inputs and
/// go through the invoker directly.
pub struct HybridExecutor {
    agent: Arc<dyn AgentInvoker>,
    invoker: Arc<ToolInvoker>,
    chains: ToolChainExecutor,
}

impl HybridExecutor {
    pub fn new(agent: Arc<dyn AgentInvoker>, invoker: Arc<ToolInvoker>) -> Self {
        let chains = ToolChainExecutor::new(invoker.clone());
        Self {
            agent,
            invoker,
            chains,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        agent_id: &str,
        tool_ids: &[String],
        strategy: HybridStrategy,
        input: &serde_json::Value,
        session: &SessionId,
        tool_ctx: &ToolCallContext,
        max_concurrency: usize,
    ) -> Result<HybridOutput> {
        match strategy {
            HybridStrategy::AgentFirst => {
                self.agent_first(agent_id, tool_ids, input, session, tool_ctx)
                    .await
            }
            HybridStrategy::ToolFirst => {
                self.tool_first(agent_id, tool_ids, input, session, tool_ctx)
                    .await
            }
            HybridStrategy::Parallel => {
                self.parallel(agent_id, tool_ids, input, session, tool_ctx, max_concurrency)
                    .await
            }
            HybridStrategy::Coordinated => {
                self.coordinated(agent_id, tool_ids, input, session, tool_ctx)
                    .await
            }
        }
    }

    /// Agent proposes an ordered tool plan, tools execute in that order,
    /// agent synthesizes a final answer from the results.
    async fn agent_first(
        &self,
        agent_id: &str,
        tool_ids: &[String],
        input: &serde_json::Value,
        session: &SessionId,
        tool_ctx: &ToolCallContext,
    ) -> Result<HybridOutput> {
        let plan_reply = self
            .ask_agent(agent_id, plan_request(input, tool_ids), session)
            .await?;
        let plan = self.extract_plan(&plan_reply.content, tool_ids);

        let records = self.run_plan(&plan, input, tool_ctx).await;

        let synth_reply = self
            .ask_agent(
                agent_id,
                json!({
                    "phase": "synthesize",
                    "input": input,
                    "tool_results": results_json(&records),
                }),
                session,
            )
            .await?;

        Ok(combine(
            synth_reply.content.clone(),
            &records,
            &[&plan_reply, &synth_reply],
            Some(&plan),
        ))
    }

    /// Tools run first as a sequential chain, their output feeds the
    /// agent.
    async fn tool_first(
        &self,
        agent_id: &str,
        tool_ids: &[String],
        input: &serde_json::Value,
        session: &SessionId,
        tool_ctx: &ToolCallContext,
    ) -> Result<HybridOutput> {
        let steps: Vec<ChainStep> = tool_ids.iter().map(ChainStep::new).collect();
        let chain = self
            .chains
            .run(
                &steps,
                input.clone(),
                tool_ctx,
                &ChainOptions {
                    strategy: ChainStrategy::Sequential,
                    ..Default::default()
                },
            )
            .await;

        let reply = self
            .ask_agent(
                agent_id,
                json!({
                    "phase": "synthesize",
                    "input": input,
                    "chain_output": chain.final_output(),
                    "tool_results": results_json(&chain.records),
                }),
                session,
            )
            .await?;

        Ok(combine(reply.content.clone(), &chain.records, &[&reply], None))
    }

    /// Agent and tools run concurrently; results are combined. Tool
    /// branches go through a parallel chain so a failed branch never
    /// cancels its siblings.
    async fn parallel(
        &self,
        agent_id: &str,
        tool_ids: &[String],
        input: &serde_json::Value,
        session: &SessionId,
        tool_ctx: &ToolCallContext,
        max_concurrency: usize,
    ) -> Result<HybridOutput> {
        let agent_fut: futures::future::BoxFuture<'_, Result<AgentReply>> = Box::pin(self.ask_agent(
            agent_id,
            json!({"phase": "analyze", "input": input}),
            session,
        ));
        let steps: Vec<ChainStep> = tool_ids.iter().map(ChainStep::new).collect();
        let chain_opts = ChainOptions {
            strategy: ChainStrategy::Parallel,
            error_mode: ChainErrorMode::Continue,
            max_concurrency,
        };
        let chain_fut = Box::pin(self.chains.run(
            &steps,
            input.clone(),
            tool_ctx,
            &chain_opts,
        ));

        let (agent_result, chain) = tokio::join!(agent_fut, chain_fut);
        let reply = agent_result?;

        Ok(combine(reply.content.clone(), &chain.records, &[&reply], None))
    }

    /// Bidirectional exchange: plan, execute, review (optionally one
    /// follow-up plan), final synthesis.
    async fn coordinated(
        &self,
        agent_id: &str,
        tool_ids: &[String],
        input: &serde_json::Value,
        session: &SessionId,
        tool_ctx: &ToolCallContext,
    ) -> Result<HybridOutput> {
        let plan_reply = self
            .ask_agent(agent_id, plan_request(input, tool_ids), session)
            .await?;
        let plan = self.extract_plan(&plan_reply.content, tool_ids);
        let mut records = self.run_plan(&plan, input, tool_ctx).await;

        let review_reply = self
            .ask_agent(
                agent_id,
                json!({
                    "phase": "review",
                    "input": input,
                    "tool_results": results_json(&records),
                    "available_tools": tool_ids,
                    "instructions": "Reply with a follow-up plan {\"steps\": [...]} or an empty plan when done.",
                }),
                session,
            )
            .await?;
        let followup = self.extract_plan(&review_reply.content, tool_ids);

        let mut replies = vec![&plan_reply, &review_reply];
        let final_content;
        let final_reply;
        if followup.steps.is_empty() {
            final_content = review_reply.content.clone();
        } else {
            records.extend(self.run_plan(&followup, input, tool_ctx).await);
            final_reply = self
                .ask_agent(
                    agent_id,
                    json!({
                        "phase": "synthesize",
                        "input": input,
                        "tool_results": results_json(&records),
                    }),
                    session,
                )
                .await?;
            final_content = final_reply.content.clone();
            replies.push(&final_reply);
        }

        Ok(combine(final_content, &records, &replies, Some(&plan)))
    }

    async fn ask_agent(
        &self,
        agent_id: &str,
        payload: serde_json::Value,
        session: &SessionId,
    ) -> Result<AgentReply> {
        self.agent
            .invoke(agent_id.to_string(), payload, session.clone())
            .await
            .map_err(|e| SkeinError::AgentExecution {
                agent: agent_id.to_string(),
                message: e.to_string(),
            })
    }

    /// Parse a plan from agent text; parse failure is an empty plan, not
    /// an error. Steps naming undeclared tools are dropped as untrusted.
    fn extract_plan(&self, content: &str, tool_ids: &[String]) -> ToolPlan {
        let plan = match parse_tool_plan(content) {
            Ok(plan) => plan,
            Err(e) => {
                debug!(error = %e, "Agent output had no usable tool plan");
                ToolPlan::default()
            }
        };
        ToolPlan {
            steps: plan
                .steps
                .into_iter()
                .filter(|step| tool_ids.contains(&step.tool_id))
                .collect(),
        }
    }

    async fn run_plan(
        &self,
        plan: &ToolPlan,
        input: &serde_json::Value,
        tool_ctx: &ToolCallContext,
    ) -> Vec<ToolInvocationRecord> {
        let mut records = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let step_input = step.input.clone().unwrap_or_else(|| input.clone());
            records.push(self.run_tool(&step.tool_id, step_input, tool_ctx).await);
        }
        records
    }

    async fn run_tool(
        &self,
        tool_id: &str,
        input: serde_json::Value,
        tool_ctx: &ToolCallContext,
    ) -> ToolInvocationRecord {
        match self
            .invoker
            .execute(tool_id, input.clone(), tool_ctx.clone())
            .await
        {
            Ok(record) => record,
            Err(err) => ToolInvocationRecord::failure(tool_id, input, err.to_string()),
        }
    }
}

fn plan_request(input: &serde_json::Value, tool_ids: &[String]) -> serde_json::Value {
    json!({
        "phase": "plan",
        "input": input,
        "available_tools": tool_ids,
        "instructions": "Reply with JSON: {\"steps\": [{\"tool_id\": \"...\", \"input\": {...}}]}",
    })
}

fn results_json(records: &[ToolInvocationRecord]) -> serde_json::Value {
    serde_json::Value::Array(
        records
            .iter()
            .map(|r| {
                json!({
                    "tool_id": r.tool_id,
                    "status": r.status,
                    "output": r.output,
                    "error": r.error,
                })
            })
            .collect(),
    )
}

fn combine(
    content: String,
    records: &[ToolInvocationRecord],
    replies: &[&AgentReply],
    plan: Option<&ToolPlan>,
) -> HybridOutput {
    let mut output = serde_json::Map::new();
    output.insert("content".to_string(), json!(content));
    output.insert("tool_results".to_string(), results_json(records));
    if let Some(plan) = plan {
        output.insert(
            "plan".to_string(),
            json!(plan.steps.iter().map(|s| s.tool_id.clone()).collect::<Vec<_>>()),
        );
    }

    HybridOutput {
        output: serde_json::Value::Object(output),
        content,
        network_calls: records.iter().map(|r| r.usage.network_calls).sum(),
        input_tokens: replies.iter().map(|r| r.input_tokens).sum(),
        output_tokens: replies.iter().map(|r| r.output_tokens).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod plan_parsing {
        use super::*;

        #[test]
        fn whole_text_object() {
            let plan = parse_tool_plan(r#"{"steps": [{"tool_id": "search", "input": {"q": "rust"}}]}"#)
                .unwrap();
            assert_eq!(plan.steps.len(), 1);
            assert_eq!(plan.steps[0].tool_id, "search");
            assert_eq!(plan.steps[0].input, Some(json!({"q": "rust"})));
        }

        #[test]
        fn bare_array_of_strings() {
            let plan = parse_tool_plan(r#"["search", "fetch"]"#).unwrap();
            assert_eq!(plan.steps.len(), 2);
            assert!(plan.steps[0].input.is_none());
        }

        #[test]
        fn fenced_block() {
            let text = "Here is my plan:\n```json\n{\"steps\": [\"search\"]}\n```\nDone.";
            let plan = parse_tool_plan(text).unwrap();
            assert_eq!(plan.steps[0].tool_id, "search");
        }

        #[test]
        fn embedded_in_prose() {
            let text = r#"I will proceed with {"steps": [{"tool": "fetch"}]} as discussed."#;
            let plan = parse_tool_plan(text).unwrap();
            assert_eq!(plan.steps[0].tool_id, "fetch");
        }

        #[test]
        fn braces_inside_strings_do_not_confuse_extraction() {
            let text = r#"Plan: {"steps": [{"tool_id": "echo", "input": {"msg": "a } b"}}]}"#;
            let plan = parse_tool_plan(text).unwrap();
            assert_eq!(plan.steps[0].input, Some(json!({"msg": "a } b"})));
        }

        #[test]
        fn no_json_at_all() {
            assert!(matches!(
                parse_tool_plan("I don't feel like planning today."),
                Err(PlanParseError::NoJson)
            ));
        }

        #[test]
        fn json_but_not_a_plan() {
            assert!(matches!(
                parse_tool_plan(r#"{"weather": "sunny"}"#),
                Err(PlanParseError::NotAPlan)
            ));
        }

        #[test]
        fn empty_steps_is_a_valid_plan() {
            let plan = parse_tool_plan(r#"{"steps": []}"#).unwrap();
            assert!(plan.steps.is_empty());
        }

        #[test]
        fn malformed_steps_are_dropped() {
            let plan = parse_tool_plan(r#"{"steps": ["ok", 42, {"no_tool_key": 1}]}"#).unwrap();
            assert_eq!(plan.steps.len(), 1);
            assert_eq!(plan.steps[0].tool_id, "ok");
        }
    }

    mod strategies {
        use super::*;
        use futures::future::BoxFuture;
        use skein_core::config::BreakerConfig;
        use skein_core::event::EventBus;
        use skein_core::types::{ToolKind, ToolSpec};
        use skein_tools::{CircuitBreaker, FunctionBackend, RetryPolicy, ToolMetrics, ToolRegistry};
        use std::collections::VecDeque;
        use std::sync::Mutex;
        use tokio::sync::RwLock;

        struct ScriptedAgent {
            replies: Mutex<VecDeque<String>>,
            requests: Mutex<Vec<serde_json::Value>>,
        }

        impl ScriptedAgent {
            fn new(replies: &[&str]) -> Self {
                Self {
                    replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
                    requests: Mutex::new(Vec::new()),
                }
            }
        }

        impl AgentInvoker for ScriptedAgent {
            fn invoke(
                &self,
                _agent_id: String,
                input: serde_json::Value,
                _session: SessionId,
            ) -> BoxFuture<'_, Result<AgentReply>> {
                self.requests.lock().unwrap().push(input);
                let reply = self
                    .replies
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| "ok".to_string());
                Box::pin(async move { Ok(AgentReply::text(reply)) })
            }
        }

        async fn executor_with(
            agent: Arc<ScriptedAgent>,
        ) -> (HybridExecutor, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let backend = FunctionBackend::new();
            for name in ["alpha", "beta"] {
                let calls = calls.clone();
                backend
                    .register(name, move |input: serde_json::Value, _| {
                        let calls = calls.clone();
                        async move {
                            calls
                                .lock()
                                .unwrap()
                                .push(input["tool"].as_str().unwrap_or("?").to_string());
                            Ok(json!({"ran": input}))
                        }
                    })
                    .await;
            }

            let mut registry = ToolRegistry::new();
            for id in ["alpha", "beta"] {
                registry.register(ToolSpec::new(id, id, ToolKind::Function));
            }
            registry.register_backend(Arc::new(backend));

            let event_bus = Arc::new(EventBus::default());
            let invoker = Arc::new(ToolInvoker::new(
                Arc::new(RwLock::new(registry)),
                Arc::new(CircuitBreaker::new(
                    BreakerConfig::default(),
                    event_bus.clone(),
                )),
                Arc::new(ToolMetrics::new()),
                RetryPolicy::none(),
                event_bus,
            ));
            (HybridExecutor::new(agent, invoker), calls)
        }

        fn tools() -> Vec<String> {
            vec!["alpha".into(), "beta".into()]
        }

        #[tokio::test]
        async fn agent_first_runs_planned_order_and_filters_undeclared() {
            let agent = Arc::new(ScriptedAgent::new(&[
                r#"{"steps": [
                    {"tool_id": "beta", "input": {"tool": "beta"}},
                    {"tool_id": "alpha", "input": {"tool": "alpha"}},
                    {"tool_id": "ghost", "input": {"tool": "ghost"}}
                ]}"#,
                "synthesized",
            ]));
            let (executor, calls) = executor_with(agent).await;

            let result = executor
                .execute(
                    "planner",
                    &tools(),
                    HybridStrategy::AgentFirst,
                    &json!({"q": 1}),
                    &SessionId::new(),
                    &ToolCallContext::default(),
                    8,
                )
                .await
                .unwrap();

            // Undeclared "ghost" dropped; declared tools in plan order
            assert_eq!(*calls.lock().unwrap(), vec!["beta", "alpha"]);
            assert_eq!(result.content, "synthesized");
            assert_eq!(result.output["plan"], json!(["beta", "alpha"]));
        }

        #[tokio::test]
        async fn agent_first_unparseable_plan_runs_no_tools() {
            let agent = Arc::new(ScriptedAgent::new(&[
                "I would rather describe my feelings about planning.",
                "synthesized anyway",
            ]));
            let (executor, calls) = executor_with(agent).await;

            let result = executor
                .execute(
                    "planner",
                    &tools(),
                    HybridStrategy::AgentFirst,
                    &json!({}),
                    &SessionId::new(),
                    &ToolCallContext::default(),
                    8,
                )
                .await
                .unwrap();

            // Parse failure is an empty plan, never an error
            assert!(calls.lock().unwrap().is_empty());
            assert_eq!(result.content, "synthesized anyway");
        }

        #[tokio::test]
        async fn tool_first_feeds_results_to_agent() {
            let agent = Arc::new(ScriptedAgent::new(&["summary"]));
            let (executor, _calls) = executor_with(agent.clone()).await;

            let result = executor
                .execute(
                    "summarizer",
                    &tools(),
                    HybridStrategy::ToolFirst,
                    &json!({"tool": "seed"}),
                    &SessionId::new(),
                    &ToolCallContext::default(),
                    8,
                )
                .await
                .unwrap();

            assert_eq!(result.content, "summary");
            let requests = agent.requests.lock().unwrap();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0]["phase"], json!("synthesize"));
            assert_eq!(requests[0]["tool_results"].as_array().unwrap().len(), 2);
        }

        #[tokio::test]
        async fn parallel_runs_agent_and_tools() {
            let agent = Arc::new(ScriptedAgent::new(&["analysis"]));
            let (executor, calls) = executor_with(agent).await;

            let result = executor
                .execute(
                    "analyst",
                    &tools(),
                    HybridStrategy::Parallel,
                    &json!({"tool": "shared"}),
                    &SessionId::new(),
                    &ToolCallContext::default(),
                    8,
                )
                .await
                .unwrap();

            assert_eq!(result.content, "analysis");
            assert_eq!(calls.lock().unwrap().len(), 2);
            assert_eq!(result.output["tool_results"].as_array().unwrap().len(), 2);
        }

        #[tokio::test]
        async fn coordinated_runs_followup_round() {
            let agent = Arc::new(ScriptedAgent::new(&[
                r#"{"steps": [{"tool_id": "alpha", "input": {"tool": "alpha"}}]}"#,
                r#"{"steps": [{"tool_id": "beta", "input": {"tool": "beta"}}]}"#,
                "final synthesis",
            ]));
            let (executor, calls) = executor_with(agent.clone()).await;

            let result = executor
                .execute(
                    "coordinator",
                    &tools(),
                    HybridStrategy::Coordinated,
                    &json!({}),
                    &SessionId::new(),
                    &ToolCallContext::default(),
                    8,
                )
                .await
                .unwrap();

            assert_eq!(*calls.lock().unwrap(), vec!["alpha", "beta"]);
            assert_eq!(result.content, "final synthesis");
            // plan, review, synthesize
            assert_eq!(agent.requests.lock().unwrap().len(), 3);
        }

        #[tokio::test]
        async fn coordinated_stops_after_empty_followup() {
            let agent = Arc::new(ScriptedAgent::new(&[
                r#"{"steps": [{"tool_id": "alpha", "input": {"tool": "alpha"}}]}"#,
                r#"{"steps": []}"#,
            ]));
            let (executor, calls) = executor_with(agent.clone()).await;

            let result = executor
                .execute(
                    "coordinator",
                    &tools(),
                    HybridStrategy::Coordinated,
                    &json!({}),
                    &SessionId::new(),
                    &ToolCallContext::default(),
                    8,
                )
                .await
                .unwrap();

            assert_eq!(*calls.lock().unwrap(), vec!["alpha"]);
            // The review reply doubles as the final content
            assert_eq!(result.content, r#"{"steps": []}"#);
            assert_eq!(agent.requests.lock().unwrap().len(), 2);
        }
    }
}
