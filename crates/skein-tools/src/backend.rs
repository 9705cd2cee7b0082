use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::debug;

use skein_core::error::{Result, SkeinError};
use skein_core::traits::ToolBackend;
use skein_core::types::{ToolCallContext, ToolKind, ToolSpec};

type ToolFn = Arc<
    dyn Fn(serde_json::Value, ToolCallContext) -> BoxFuture<'static, Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// Backend for `function` tools: named async closures registered
/// in-process. The function name defaults to the tool id, overridable
/// via `config.function` on the tool spec.
pub struct FunctionBackend {
    functions: RwLock<HashMap<String, ToolFn>>,
}

impl FunctionBackend {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(serde_json::Value, ToolCallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let wrapped: ToolFn = Arc::new(move |input, ctx| Box::pin(f(input, ctx)));
        self.functions.write().await.insert(name.into(), wrapped);
    }
}

impl Default for FunctionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolBackend for FunctionBackend {
    fn kind(&self) -> ToolKind {
        ToolKind::Function
    }

    fn call(
        &self,
        spec: ToolSpec,
        input: serde_json::Value,
        ctx: ToolCallContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let name = spec
                .config
                .get("function")
                .and_then(|v| v.as_str())
                .unwrap_or(&spec.id)
                .to_string();

            let f = self.functions.read().await.get(&name).cloned();
            let f = f.ok_or_else(|| SkeinError::ToolExecution {
                tool: spec.id.clone(),
                message: format!("no function registered for '{}'", name),
            })?;

            debug!(tool_id = %spec.id, function = %name, "Dispatching function tool");
            f(input, ctx).await
        })
    }
}

/// Backend for `rest` tools: one HTTP request per call, shaped by the
/// spec's config (`url`, optional `method` and `headers`), JSON body in,
/// JSON body out.
pub struct RestBackend {
    client: reqwest::Client,
}

impl RestBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for RestBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolBackend for RestBackend {
    fn kind(&self) -> ToolKind {
        ToolKind::Rest
    }

    fn call(
        &self,
        spec: ToolSpec,
        input: serde_json::Value,
        _ctx: ToolCallContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let url = spec
                .config
                .get("url")
                .and_then(|v| v.as_str())
                .ok_or_else(|| SkeinError::Config(format!(
                    "REST tool '{}' has no url configured",
                    spec.id
                )))?
                .to_string();
            let method = spec
                .config
                .get("method")
                .and_then(|v| v.as_str())
                .unwrap_or("POST")
                .to_uppercase();

            let mut request = match method.as_str() {
                "GET" => self.client.get(&url),
                "PUT" => self.client.put(&url).json(&input),
                "DELETE" => self.client.delete(&url),
                "PATCH" => self.client.patch(&url).json(&input),
                _ => self.client.post(&url).json(&input),
            };

            if let Some(headers) = spec.config.get("headers").and_then(|h| h.as_object()) {
                for (name, value) in headers {
                    if let Some(value) = value.as_str() {
                        request = request.header(name, value);
                    }
                }
            }

            debug!(tool_id = %spec.id, %method, %url, "Dispatching REST tool");

            let response = request.send().await.map_err(|e| SkeinError::ToolExecution {
                tool: spec.id.clone(),
                message: e.to_string(),
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(SkeinError::ToolExecution {
                    tool: spec.id.clone(),
                    message: format!("HTTP {}", status.as_u16()),
                });
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| SkeinError::ToolExecution {
                    tool: spec.id.clone(),
                    message: format!("invalid JSON response: {}", e),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn function_dispatch_by_id() {
        let backend = FunctionBackend::new();
        backend
            .register("double", |input: serde_json::Value, _ctx| async move {
                let x = input.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!({"x": x * 2}))
            })
            .await;

        let spec = ToolSpec::new("double", "Double", ToolKind::Function);
        let out = backend
            .call(spec, json!({"x": 5}), ToolCallContext::default())
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 10}));
    }

    #[tokio::test]
    async fn function_name_override() {
        let backend = FunctionBackend::new();
        backend
            .register("impl_v2", |_, _| async { Ok(json!("v2")) })
            .await;

        let spec = ToolSpec::new("double", "Double", ToolKind::Function)
            .with_config(json!({"function": "impl_v2"}));
        let out = backend
            .call(spec, json!({}), ToolCallContext::default())
            .await
            .unwrap();
        assert_eq!(out, json!("v2"));
    }

    #[tokio::test]
    async fn unregistered_function_fails() {
        let backend = FunctionBackend::new();
        let spec = ToolSpec::new("ghost", "Ghost", ToolKind::Function);
        let result = backend
            .call(spec, json!({}), ToolCallContext::default())
            .await;
        assert!(matches!(result, Err(SkeinError::ToolExecution { .. })));
    }

    #[tokio::test]
    async fn rest_requires_url() {
        let backend = RestBackend::new();
        let spec = ToolSpec::new("api", "Api", ToolKind::Rest);
        let result = backend
            .call(spec, json!({}), ToolCallContext::default())
            .await;
        assert!(matches!(result, Err(SkeinError::Config(_))));
    }
}
