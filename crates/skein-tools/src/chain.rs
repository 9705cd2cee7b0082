use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use skein_core::expr;
use skein_core::types::{NodeStatus, ToolCallContext, ToolInvocationRecord};

use crate::invoker::ToolInvoker;

/// How a chain composes its tool invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStrategy {
    /// Output of tool i feeds tool i+1.
    Sequential,
    /// All tools run concurrently against the same input.
    Parallel,
    /// Sequential, but each step may carry a gating expression.
    Conditional,
}

/// Chain-level failure policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainErrorMode {
    /// First failure aborts the chain; remaining steps are skipped.
    #[default]
    Stop,
    /// Re-invoke the failed tool once before deciding like `Stop`.
    Retry,
    /// Keep going; a failed step passes its input forward unchanged.
    Continue,
}

/// One step in a chain.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChainStep {
    pub tool_id: String,
    /// Gating expression for `Conditional` chains; a false gate skips
    /// this step without affecting the others.
    #[serde(default)]
    pub condition: Option<String>,
}

impl ChainStep {
    pub fn new(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ChainOptions {
    pub strategy: ChainStrategy,
    pub error_mode: ChainErrorMode,
    /// Concurrency cap for parallel chains.
    pub max_concurrency: usize,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            strategy: ChainStrategy::Sequential,
            error_mode: ChainErrorMode::Stop,
            max_concurrency: 8,
        }
    }
}

/// Aggregate result of a chain. Every step's record is reported; no
/// branch is silently dropped.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub status: NodeStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub records: Vec<ToolInvocationRecord>,
    /// Outputs of the successful steps, in step order.
    pub outputs: Vec<serde_json::Value>,
}

impl ChainResult {
    fn from_records(records: Vec<ToolInvocationRecord>, aborted: bool) -> Self {
        let total = records.len();
        let succeeded = records.iter().filter(|r| r.succeeded()).count();
        let failed = records
            .iter()
            .filter(|r| r.status == NodeStatus::Failed)
            .count();
        let outputs = records
            .iter()
            .filter(|r| r.succeeded())
            .filter_map(|r| r.output.clone())
            .collect();
        let status = if aborted || (failed > 0 && succeeded == 0 && total > 0) {
            NodeStatus::Failed
        } else {
            NodeStatus::Completed
        };
        Self {
            status,
            total,
            succeeded,
            failed,
            records,
            outputs,
        }
    }

    /// The chain's final value: last successful output, or null.
    pub fn final_output(&self) -> serde_json::Value {
        self.outputs.last().cloned().unwrap_or(serde_json::Value::Null)
    }
}

/// Composes multiple tool invocations sequentially, in parallel, or
/// conditionally, delegating each call to the `ToolInvoker`.
pub struct ToolChainExecutor {
    invoker: Arc<ToolInvoker>,
}

impl ToolChainExecutor {
    pub fn new(invoker: Arc<ToolInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn run(
        &self,
        steps: &[ChainStep],
        input: serde_json::Value,
        ctx: &ToolCallContext,
        options: &ChainOptions,
    ) -> ChainResult {
        match options.strategy {
            ChainStrategy::Sequential => {
                self.run_sequential(steps, input, ctx, options.error_mode, false)
                    .await
            }
            ChainStrategy::Conditional => {
                self.run_sequential(steps, input, ctx, options.error_mode, true)
                    .await
            }
            ChainStrategy::Parallel => self.run_parallel(steps, input, ctx, options).await,
        }
    }

    /// Invoke one tool, converting hard rejections into failure records
    /// so the chain always has something to report.
    async fn invoke(
        &self,
        tool_id: &str,
        input: serde_json::Value,
        ctx: &ToolCallContext,
    ) -> ToolInvocationRecord {
        match self
            .invoker
            .execute(tool_id, input.clone(), ctx.clone())
            .await
        {
            Ok(record) => record,
            Err(err) => ToolInvocationRecord::failure(tool_id, input, err.to_string()),
        }
    }

    async fn run_sequential(
        &self,
        steps: &[ChainStep],
        input: serde_json::Value,
        ctx: &ToolCallContext,
        error_mode: ChainErrorMode,
        gated: bool,
    ) -> ChainResult {
        let mut records = Vec::with_capacity(steps.len());
        let mut current = input;
        let mut aborted = false;

        for step in steps {
            if aborted {
                records.push(ToolInvocationRecord::skipped(
                    &step.tool_id,
                    current.clone(),
                ));
                continue;
            }

            if gated {
                if let Some(condition) = &step.condition {
                    let scope = expr::scope_from_value(&current);
                    if !expr::evaluate_or_false(condition, &scope) {
                        debug!(tool_id = %step.tool_id, %condition, "Chain gate false, skipping step");
                        records.push(ToolInvocationRecord::skipped(
                            &step.tool_id,
                            current.clone(),
                        ));
                        continue;
                    }
                }
            }

            let mut record = self.invoke(&step.tool_id, current.clone(), ctx).await;

            if !record.succeeded() && error_mode == ChainErrorMode::Retry {
                warn!(tool_id = %step.tool_id, "Chain step failed, re-invoking once");
                record = self.invoke(&step.tool_id, current.clone(), ctx).await;
            }

            if record.succeeded() {
                current = record.output.clone().unwrap_or(serde_json::Value::Null);
                records.push(record);
            } else {
                records.push(record);
                match error_mode {
                    // `Continue` passes the pre-failure input forward unchanged.
                    ChainErrorMode::Continue => {}
                    ChainErrorMode::Stop | ChainErrorMode::Retry => aborted = true,
                }
            }
        }

        ChainResult::from_records(records, aborted)
    }

    async fn run_parallel(
        &self,
        steps: &[ChainStep],
        input: serde_json::Value,
        ctx: &ToolCallContext,
        options: &ChainOptions,
    ) -> ChainResult {
        // All branches settle before any failure decision; a failed
        // branch does not cancel its siblings.
        let mut records: Vec<ToolInvocationRecord> = stream::iter(
            steps
                .iter()
                .map(|step| self.invoke(&step.tool_id, input.clone(), ctx)),
        )
        .buffered(options.max_concurrency.max(1))
        .collect()
        .await;

        if options.error_mode == ChainErrorMode::Retry {
            for record in records.iter_mut() {
                if record.status == NodeStatus::Failed {
                    let tool_id = record.tool_id.clone();
                    warn!(%tool_id, "Parallel branch failed, re-invoking once");
                    *record = self.invoke(&tool_id, input.clone(), ctx).await;
                }
            }
        }

        let any_failed = records.iter().any(|r| r.status == NodeStatus::Failed);
        let aborted = any_failed
            && matches!(
                options.error_mode,
                ChainErrorMode::Stop | ChainErrorMode::Retry
            );
        ChainResult::from_records(records, aborted)
    }
}
