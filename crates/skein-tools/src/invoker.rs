use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use skein_core::error::{Result, SkeinError};
use skein_core::event::{EngineEvent, EventBus};
use skein_core::types::{ResourceUsage, ToolCallContext, ToolInvocationRecord};

use crate::breaker::CircuitBreaker;
use crate::metrics::ToolMetrics;
use crate::registry::ToolRegistry;
use crate::retry::RetryPolicy;
use crate::schema;

const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Executes one tool call: breaker gate, schema checks, retried backend
/// dispatch, and bookkeeping.
pub struct ToolInvoker {
    registry: Arc<RwLock<ToolRegistry>>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<ToolMetrics>,
    retry: RetryPolicy,
    event_bus: Arc<EventBus>,
}

impl ToolInvoker {
    pub fn new(
        registry: Arc<RwLock<ToolRegistry>>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<ToolMetrics>,
        retry: RetryPolicy,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            breaker,
            metrics,
            retry,
            event_bus,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<ToolMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<RwLock<ToolRegistry>> {
        &self.registry
    }

    /// Execute a tool call.
    ///
    /// Hard rejections (unknown/inactive tool, missing backend, input
    /// schema violation, open breaker) return `Err` without touching the
    /// backend. Backend failures after retries return an `Ok` record with
    /// `Failed` status; breaker and metrics are updated either way.
    pub async fn execute(
        &self,
        tool_id: &str,
        input: serde_json::Value,
        ctx: ToolCallContext,
    ) -> Result<ToolInvocationRecord> {
        let (spec, backend) = {
            let registry = self.registry.read().await;
            let spec = registry.resolve(tool_id)?;
            let backend = registry
                .backend_for(spec.kind)
                .ok_or_else(|| SkeinError::BackendMissing(spec.kind.to_string()))?;
            (spec, backend)
        };

        // Input schema violations are terminal for this call, never retried.
        if let Some(input_schema) = &spec.input_schema {
            if let Err(violations) = schema::validate(input_schema, &input) {
                return Err(SkeinError::SchemaValidation(format!(
                    "{}: {}",
                    tool_id,
                    violations.join("; ")
                )));
            }
        }

        // Fail fast while the breaker is open; no backend attempt.
        self.breaker.preflight(tool_id).await?;

        let timeout = Duration::from_secs(
            spec.config
                .get("timeout_secs")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
        );

        let attempts = AtomicU32::new(0);
        let start = Instant::now();
        let result = self
            .retry
            .run(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let backend = backend.clone();
                let spec = spec.clone();
                let input = input.clone();
                let ctx = ctx.clone();
                async move {
                    match tokio::time::timeout(timeout, backend.call(spec, input, ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(SkeinError::ToolTimeout {
                            tool: tool_id.to_string(),
                            timeout_secs: timeout.as_secs(),
                        }),
                    }
                }
            })
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let attempts = attempts.load(Ordering::SeqCst);
        let succeeded = result.is_ok();

        // Breaker and rolling metrics update regardless of outcome.
        if succeeded {
            self.breaker.record_success(tool_id).await;
        } else {
            self.breaker.record_failure(tool_id).await;
        }
        self.metrics.record(tool_id, elapsed_ms, succeeded).await;
        self.event_bus.publish(EngineEvent::ToolInvoked {
            tool_id: tool_id.to_string(),
            succeeded,
            elapsed_ms,
        });

        let mut record = match result {
            Ok(output) => {
                // Output schema mismatches are advisory only.
                if let Some(output_schema) = &spec.output_schema {
                    if let Err(violations) = schema::validate(output_schema, &output) {
                        warn!(
                            tool_id,
                            violations = %violations.join("; "),
                            "Tool output does not match declared schema"
                        );
                    }
                }
                debug!(tool_id, elapsed_ms, "Tool call completed");
                ToolInvocationRecord::success(tool_id, input, output)
            }
            Err(err) => {
                debug!(tool_id, elapsed_ms, error = %err, "Tool call failed");
                ToolInvocationRecord::failure(tool_id, input, err.to_string())
            }
        };

        let payload_bytes = record
            .output
            .as_ref()
            .and_then(|o| serde_json::to_vec(o).ok())
            .map(|b| b.len() as u64)
            .unwrap_or(0);

        record.retry_count = attempts.saturating_sub(1);
        record.usage = ResourceUsage {
            elapsed_ms,
            memory_bytes: 0,
            network_calls: attempts,
            payload_bytes,
        };
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use skein_core::config::BreakerConfig;
    use skein_core::traits::ToolBackend;
    use skein_core::types::{ToolKind, ToolSpec};
    use std::sync::atomic::AtomicU64;

    /// Backend that fails the first `fail_first` calls, then succeeds by
    /// echoing the input under `"echo"`.
    struct FlakyBackend {
        fail_first: u64,
        calls: AtomicU64,
    }

    impl FlakyBackend {
        fn new(fail_first: u64) -> Self {
            Self {
                fail_first,
                calls: AtomicU64::new(0),
            }
        }
    }

    impl ToolBackend for FlakyBackend {
        fn kind(&self) -> ToolKind {
            ToolKind::Function
        }

        fn call(
            &self,
            _spec: ToolSpec,
            input: serde_json::Value,
            _ctx: ToolCallContext,
        ) -> BoxFuture<'_, skein_core::error::Result<serde_json::Value>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = call < self.fail_first;
            Box::pin(async move {
                if fail {
                    Err(SkeinError::ToolExecution {
                        tool: "flaky".into(),
                        message: "connection reset".into(),
                    })
                } else {
                    Ok(json!({"echo": input}))
                }
            })
        }
    }

    fn invoker_with(backend: Arc<dyn ToolBackend>, spec: ToolSpec, retry: RetryPolicy) -> ToolInvoker {
        let mut registry = ToolRegistry::new();
        registry.register(spec);
        registry.register_backend(backend);
        let event_bus = Arc::new(EventBus::default());
        ToolInvoker::new(
            Arc::new(RwLock::new(registry)),
            Arc::new(CircuitBreaker::new(
                BreakerConfig::default(),
                event_bus.clone(),
            )),
            Arc::new(ToolMetrics::new()),
            retry,
            event_bus,
        )
    }

    fn retry_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff: skein_core::config::BackoffKind::Exponential,
            base_delay: Duration::from_millis(10),
            retryable: vec!["connection".into()],
        }
    }

    #[tokio::test]
    async fn success_path() {
        let invoker = invoker_with(
            Arc::new(FlakyBackend::new(0)),
            ToolSpec::new("echo", "Echo", ToolKind::Function),
            RetryPolicy::none(),
        );

        let record = invoker
            .execute("echo", json!({"x": 1}), ToolCallContext::default())
            .await
            .unwrap();

        assert!(record.succeeded());
        assert_eq!(record.usage.network_calls, 1);
        assert_eq!(record.retry_count, 0);
        assert!(record.usage.payload_bytes > 0);

        let stats = invoker.metrics().snapshot("echo").await.unwrap();
        assert_eq!(stats.invocations, 1);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test]
    async fn unknown_tool_rejected() {
        let invoker = invoker_with(
            Arc::new(FlakyBackend::new(0)),
            ToolSpec::new("echo", "Echo", ToolKind::Function),
            RetryPolicy::none(),
        );
        let result = invoker
            .execute("nope", json!({}), ToolCallContext::default())
            .await;
        assert!(matches!(result, Err(SkeinError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn inactive_tool_rejected() {
        let invoker = invoker_with(
            Arc::new(FlakyBackend::new(0)),
            ToolSpec::new("echo", "Echo", ToolKind::Function).inactive(),
            RetryPolicy::none(),
        );
        let result = invoker
            .execute("echo", json!({}), ToolCallContext::default())
            .await;
        assert!(matches!(result, Err(SkeinError::ToolInactive(_))));
    }

    #[tokio::test]
    async fn input_schema_violation_is_terminal() {
        let backend = Arc::new(FlakyBackend::new(0));
        let spec = ToolSpec::new("echo", "Echo", ToolKind::Function).with_input_schema(json!({
            "type": "object",
            "required": ["x"]
        }));
        let invoker = invoker_with(backend.clone(), spec, retry_policy());

        let result = invoker
            .execute("echo", json!({}), ToolCallContext::default())
            .await;
        assert!(matches!(result, Err(SkeinError::SchemaValidation(_))));
        // Backend never attempted
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn output_schema_mismatch_is_advisory() {
        let spec = ToolSpec::new("echo", "Echo", ToolKind::Function).with_output_schema(json!({
            "type": "object",
            "required": ["definitely_missing"]
        }));
        let invoker = invoker_with(Arc::new(FlakyBackend::new(0)), spec, RetryPolicy::none());

        let record = invoker
            .execute("echo", json!({"x": 1}), ToolCallContext::default())
            .await
            .unwrap();
        // Unvalidated result returned rather than failing the call
        assert!(record.succeeded());
        assert!(record.output.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retried() {
        let backend = Arc::new(FlakyBackend::new(2));
        let invoker = invoker_with(
            backend.clone(),
            ToolSpec::new("flaky", "Flaky", ToolKind::Function),
            retry_policy(),
        );

        let record = invoker
            .execute("flaky", json!({}), ToolCallContext::default())
            .await
            .unwrap();

        assert!(record.succeeded());
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.usage.network_calls, 3);
    }

    #[tokio::test]
    async fn breaker_open_fails_fast() {
        let backend = Arc::new(FlakyBackend::new(u64::MAX));
        let invoker = invoker_with(
            backend.clone(),
            ToolSpec::new("flaky", "Flaky", ToolKind::Function),
            RetryPolicy::none(),
        );

        // Five failed calls open the breaker
        for _ in 0..5 {
            let record = invoker
                .execute("flaky", json!({}), ToolCallContext::default())
                .await
                .unwrap();
            assert!(!record.succeeded());
        }
        let calls_before = backend.calls.load(Ordering::SeqCst);

        let result = invoker
            .execute("flaky", json!({}), ToolCallContext::default())
            .await;
        assert!(matches!(result, Err(SkeinError::BreakerOpen { .. })));
        // No additional backend attempt while open
        assert_eq!(backend.calls.load(Ordering::SeqCst), calls_before);
    }
}
