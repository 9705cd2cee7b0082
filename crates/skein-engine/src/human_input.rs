use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use skein_core::event::{EngineEvent, EventBus};
use skein_core::types::RunId;

use crate::graph::definition::HumanInputKind;

/// A pending human-input request, announced on the event bus.
#[derive(Debug, Clone)]
pub struct HumanRequest {
    pub run_id: RunId,
    pub node_id: String,
    pub prompt: String,
    pub input_type: HumanInputKind,
    pub timeout_secs: u64,
    pub assignee: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// A human-input response delivered to the waiting node.
#[derive(Debug, Clone)]
pub struct HumanResponse {
    pub value: serde_json::Value,
    pub responder_id: Option<String>,
    pub responded_at: DateTime<Utc>,
}

/// Manages pending human-input requests with oneshot channels.
///
/// A `human_input` node registers a request keyed by `(run_id, node_id)`
/// and suspends on the returned receiver; it neither blocks a worker
/// thread nor polls. A response resolves the oneshot; the node's timeout
/// path removes the entry instead.
pub struct HumanInputBroker {
    pending: Mutex<HashMap<(String, String), (HumanRequest, oneshot::Sender<HumanResponse>)>>,
    event_bus: Arc<EventBus>,
}

impl HumanInputBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a request, publish the event, return the receiver to await.
    pub async fn request(&self, req: HumanRequest) -> oneshot::Receiver<HumanResponse> {
        let (tx, rx) = oneshot::channel();
        let key = (req.run_id.0.clone(), req.node_id.clone());

        self.event_bus.publish(EngineEvent::HumanInputRequired {
            run_id: req.run_id.clone(),
            node_id: req.node_id.clone(),
            prompt: req.prompt.clone(),
        });

        self.pending.lock().await.insert(key, (req, tx));
        rx
    }

    /// Deliver a response for `(run_id, node_id)`.
    /// Returns true if a matching request was pending.
    pub async fn respond(
        &self,
        run_id: &RunId,
        node_id: &str,
        value: serde_json::Value,
        responder_id: Option<String>,
    ) -> bool {
        let key = (run_id.0.clone(), node_id.to_string());
        let entry = self.pending.lock().await.remove(&key);
        if let Some((_req, tx)) = entry {
            self.event_bus.publish(EngineEvent::HumanInputResponse {
                run_id: run_id.clone(),
                node_id: node_id.to_string(),
                value: value.clone(),
            });
            let response = HumanResponse {
                value,
                responder_id,
                responded_at: Utc::now(),
            };
            // Ignore send error (receiver may have been dropped on timeout)
            let _ = tx.send(response);
            true
        } else {
            false
        }
    }

    /// Drop a pending request (timeout path). Returns true if it existed.
    pub async fn cancel(&self, run_id: &RunId, node_id: &str) -> bool {
        let key = (run_id.0.clone(), node_id.to_string());
        let removed = self.pending.lock().await.remove(&key).is_some();
        if removed {
            debug!(run_id = %run_id, node_id, "Pending human input cancelled");
        }
        removed
    }

    /// Drop every pending request of a run (run cancellation). Returns
    /// how many were dropped; their receivers resolve with an error.
    pub async fn cancel_run(&self, run_id: &RunId) -> usize {
        let mut pending = self.pending.lock().await;
        let keys: Vec<_> = pending
            .keys()
            .filter(|(rid, _)| *rid == run_id.0)
            .cloned()
            .collect();
        for key in &keys {
            pending.remove(key);
        }
        keys.len()
    }

    /// List all pending requests.
    pub async fn pending_requests(&self) -> Vec<HumanRequest> {
        self.pending
            .lock()
            .await
            .values()
            .map(|(req, _)| req.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(run_id: &RunId, node_id: &str) -> HumanRequest {
        HumanRequest {
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
            prompt: "Approve the deploy?".to_string(),
            input_type: HumanInputKind::Boolean,
            timeout_secs: 60,
            assignee: None,
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn respond_resolves_receiver() {
        let broker = HumanInputBroker::new(Arc::new(EventBus::default()));
        let run_id = RunId::new();

        let rx = broker.request(request(&run_id, "gate")).await;
        assert!(
            broker
                .respond(&run_id, "gate", json!(true), Some("alice".into()))
                .await
        );

        let response = rx.await.unwrap();
        assert_eq!(response.value, json!(true));
        assert_eq!(response.responder_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn respond_requires_matching_key() {
        let broker = HumanInputBroker::new(Arc::new(EventBus::default()));
        let run_id = RunId::new();

        let _rx = broker.request(request(&run_id, "gate")).await;
        assert!(!broker.respond(&run_id, "other", json!(1), None).await);
        assert!(!broker.respond(&RunId::new(), "gate", json!(1), None).await);
    }

    #[tokio::test]
    async fn events_published() {
        let bus = Arc::new(EventBus::default());
        let broker = HumanInputBroker::new(bus.clone());
        let mut rx = bus.subscribe();
        let run_id = RunId::new();

        let _pending = broker.request(request(&run_id, "gate")).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::HumanInputRequired { .. }
        ));

        broker.respond(&run_id, "gate", json!("ok"), None).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::HumanInputResponse { .. }
        ));
    }

    #[tokio::test]
    async fn cancel_run_drops_pending() {
        let broker = HumanInputBroker::new(Arc::new(EventBus::default()));
        let run_id = RunId::new();

        let rx1 = broker.request(request(&run_id, "gate1")).await;
        let _rx2 = broker.request(request(&run_id, "gate2")).await;
        let _other = broker.request(request(&RunId::new(), "gate1")).await;

        assert_eq!(broker.cancel_run(&run_id).await, 2);
        assert_eq!(broker.pending_requests().await.len(), 1);
        // Dropped sender resolves the receiver with an error
        assert!(rx1.await.is_err());
    }

    #[tokio::test]
    async fn cancel_single_request() {
        let broker = HumanInputBroker::new(Arc::new(EventBus::default()));
        let run_id = RunId::new();

        let _rx = broker.request(request(&run_id, "gate")).await;
        assert!(broker.cancel(&run_id, "gate").await);
        assert!(!broker.cancel(&run_id, "gate").await);
        // Late response finds nothing
        assert!(!broker.respond(&run_id, "gate", json!(1), None).await);
    }
}
