use std::collections::HashMap;
use std::sync::Arc;

use skein_core::error::{Result, SkeinError};
use skein_core::traits::ToolBackend;
use skein_core::types::{ToolKind, ToolSpec};

/// Registry of tool declarations and the backends that execute them.
///
/// Specs are keyed by tool id; backends by tool kind. A tool is callable
/// only when its spec is registered, active, and a backend for its kind
/// exists.
pub struct ToolRegistry {
    specs: HashMap<String, ToolSpec>,
    backends: HashMap<ToolKind, Arc<dyn ToolBackend>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            specs: HashMap::new(),
            backends: HashMap::new(),
        }
    }

    /// Register a tool spec, replacing any previous spec with the same id.
    pub fn register(&mut self, spec: ToolSpec) {
        self.specs.insert(spec.id.clone(), spec);
    }

    /// Unregister a tool by id.
    pub fn unregister(&mut self, id: &str) -> bool {
        self.specs.remove(id).is_some()
    }

    /// Get a tool spec by id.
    pub fn get(&self, id: &str) -> Option<&ToolSpec> {
        self.specs.get(id)
    }

    /// List all registered tool ids.
    pub fn list(&self) -> Vec<&str> {
        self.specs.keys().map(|s| s.as_str()).collect()
    }

    /// Register a backend for its declared kind.
    pub fn register_backend(&mut self, backend: Arc<dyn ToolBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    /// Get the backend serving a tool kind.
    pub fn backend_for(&self, kind: ToolKind) -> Option<Arc<dyn ToolBackend>> {
        self.backends.get(&kind).cloned()
    }

    /// Resolve a callable tool: spec must exist and be active.
    pub fn resolve(&self, id: &str) -> Result<ToolSpec> {
        let spec = self
            .specs
            .get(id)
            .ok_or_else(|| SkeinError::ToolNotFound(id.to_string()))?;
        if !spec.active {
            return Err(SkeinError::ToolInactive(id.to_string()));
        }
        Ok(spec.clone())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
