use crate::types::{NodeStatus, RunId, RunStatus};

/// Engine lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A run left the queue and began executing.
    RunStarted { run_id: RunId },
    /// A node began executing.
    NodeStarted { run_id: RunId, node_id: String },
    /// A node reached a terminal status.
    NodeCompleted {
        run_id: RunId,
        node_id: String,
        status: NodeStatus,
    },
    /// A run reached a terminal status.
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
    },
    /// A run was cancelled by the caller.
    RunCancelled { run_id: RunId },
    /// A human-input node is waiting for a response.
    HumanInputRequired {
        run_id: RunId,
        node_id: String,
        prompt: String,
    },
    /// A human-input response was received.
    HumanInputResponse {
        run_id: RunId,
        node_id: String,
        value: serde_json::Value,
    },
    /// A tool invocation finished (either way).
    ToolInvoked {
        tool_id: String,
        succeeded: bool,
        elapsed_ms: u64,
    },
    /// A circuit breaker opened after consecutive failures.
    BreakerOpened { tool_id: String },
    /// A circuit breaker closed (trial success or sweep).
    BreakerClosed { tool_id: String },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let run_id = RunId::new();
        bus.publish(EngineEvent::RunStarted {
            run_id: run_id.clone(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::RunStarted { run_id: got } => assert_eq!(got, run_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::BreakerOpened {
            tool_id: "t".into(),
        });
    }
}
