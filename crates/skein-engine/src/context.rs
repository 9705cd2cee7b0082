use std::collections::{HashMap, HashSet};

/// Mutable state threaded through one workflow run.
///
/// Owned exclusively by its run and dropped with it: a variable map,
/// per-node memory snapshots, last-known agent and tool state, and the
/// set of nodes awaiting human input.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    variables: HashMap<String, serde_json::Value>,
    node_memory: HashMap<String, serde_json::Value>,
    agent_state: HashMap<String, serde_json::Value>,
    tool_state: HashMap<String, serde_json::Value>,
    pending_inputs: HashSet<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn variable(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables.get(key)
    }

    pub fn variables(&self) -> &HashMap<String, serde_json::Value> {
        &self.variables
    }

    /// Snapshot a node's output into per-node memory.
    pub fn remember_node(&mut self, node_id: impl Into<String>, output: serde_json::Value) {
        self.node_memory.insert(node_id.into(), output);
    }

    pub fn node_memory(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.node_memory.get(node_id)
    }

    pub fn set_agent_state(&mut self, agent_id: impl Into<String>, state: serde_json::Value) {
        self.agent_state.insert(agent_id.into(), state);
    }

    pub fn agent_state(&self, agent_id: &str) -> Option<&serde_json::Value> {
        self.agent_state.get(agent_id)
    }

    pub fn set_tool_state(&mut self, tool_id: impl Into<String>, state: serde_json::Value) {
        self.tool_state.insert(tool_id.into(), state);
    }

    pub fn tool_state(&self, tool_id: &str) -> Option<&serde_json::Value> {
        self.tool_state.get(tool_id)
    }

    pub fn mark_pending_input(&mut self, node_id: impl Into<String>) {
        self.pending_inputs.insert(node_id.into());
    }

    pub fn resolve_pending_input(&mut self, node_id: &str) -> bool {
        self.pending_inputs.remove(node_id)
    }

    pub fn pending_inputs(&self) -> &HashSet<String> {
        &self.pending_inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn variables() {
        let mut ctx = ExecutionContext::new();
        ctx.set_variable("count", json!(3));
        assert_eq!(ctx.variable("count"), Some(&json!(3)));
        assert_eq!(ctx.variable("missing"), None);
    }

    #[test]
    fn node_memory_and_states() {
        let mut ctx = ExecutionContext::new();
        ctx.remember_node("n1", json!({"x": 1}));
        ctx.set_agent_state("researcher", json!({"content": "hi"}));
        ctx.set_tool_state("search", json!({"hits": 2}));

        assert_eq!(ctx.node_memory("n1"), Some(&json!({"x": 1})));
        assert_eq!(ctx.agent_state("researcher"), Some(&json!({"content": "hi"})));
        assert_eq!(ctx.tool_state("search"), Some(&json!({"hits": 2})));
    }

    #[test]
    fn pending_inputs() {
        let mut ctx = ExecutionContext::new();
        ctx.mark_pending_input("gate");
        assert!(ctx.pending_inputs().contains("gate"));
        assert!(ctx.resolve_pending_input("gate"));
        assert!(!ctx.resolve_pending_input("gate"));
    }
}
