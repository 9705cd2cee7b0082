use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use skein_core::config::EngineConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::event::{EngineEvent, EventBus};
use skein_core::types::{
    NodeExecutionRecord, NodeStatus, Priority, RunId, RunStatus, SessionId, ToolCallContext,
};
use skein_tools::retry::RetryPolicy;

use crate::context::ExecutionContext;
use crate::dispatcher::NodeDispatcher;
use crate::graph::definition::{ErrorMode, WorkflowDefinition};
use crate::graph::scheduler::{Admission, DependencyScheduler};
use crate::graph::validator;
use crate::human_input::HumanInputBroker;

/// Workflow definition storage is external to the engine; runs resolve
/// their definitions through this contract.
pub trait DefinitionStore: Send + Sync + 'static {
    fn load(&self, workflow_id: &str) -> BoxFuture<'_, Result<WorkflowDefinition>>;
}

/// In-memory definition store for embedding and tests.
pub struct InMemoryDefinitionStore {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, def: WorkflowDefinition) {
        self.definitions.write().await.insert(def.id.clone(), def);
    }
}

impl Default for InMemoryDefinitionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionStore for InMemoryDefinitionStore {
    fn load(&self, workflow_id: &str) -> BoxFuture<'_, Result<WorkflowDefinition>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            self.definitions
                .read()
                .await
                .get(&workflow_id)
                .cloned()
                .ok_or(SkeinError::WorkflowNotFound(workflow_id))
        })
    }
}

/// Options attached to a run submission.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub priority: Priority,
    pub timeout_secs: Option<u64>,
    pub session_id: Option<SessionId>,
    pub submitter: Option<String>,
    pub organization: Option<String>,
}

/// Per-status node counts computed at finalization.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    fn from_records(records: &HashMap<String, NodeExecutionRecord>) -> Self {
        let mut summary = Self {
            total: records.len(),
            ..Self::default()
        };
        for record in records.values() {
            match record.status {
                NodeStatus::Completed => summary.completed += 1,
                NodeStatus::Failed => summary.failed += 1,
                NodeStatus::Skipped => summary.skipped += 1,
                NodeStatus::Pending | NodeStatus::Running => {}
            }
        }
        summary
    }
}

/// One instantiation of a workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: String,
    pub status: RunStatus,
    pub priority: Priority,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub session_id: SessionId,
    pub submitter: Option<String>,
    pub organization: Option<String>,
    pub records: HashMap<String, NodeExecutionRecord>,
    pub summary: Option<RunSummary>,
}

/// Filters for run history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunControl {
    Run,
    Pause,
    Cancel,
}

struct RunSlot {
    run: WorkflowRun,
    definition: Arc<WorkflowDefinition>,
    control: watch::Sender<RunControl>,
    timeout_secs: u64,
}

struct QueuedRun {
    priority: Priority,
    seq: u64,
    run_id: RunId,
}

impl PartialEq for QueuedRun {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedRun {}

impl PartialOrd for QueuedRun {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRun {
    // Max-heap: higher priority first, FIFO within a priority
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    store: Arc<dyn DefinitionStore>,
    dispatcher: Arc<NodeDispatcher>,
    human: Arc<HumanInputBroker>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    runs: RwLock<HashMap<String, RunSlot>>,
    queue: Mutex<BinaryHeap<QueuedRun>>,
    notify: Notify,
    seq: AtomicU64,
    cancel: CancellationToken,
}

/// Owns the pending-run priority queue, drives the scheduler and
/// dispatcher to completion, and emits lifecycle events.
///
/// A single processing loop dequeues runs, so at most one run is started
/// at a time; a started run executes as its own task and its internal
/// parallel branches run concurrently.
pub struct WorkflowCoordinator {
    inner: Arc<Inner>,
}

impl WorkflowCoordinator {
    pub fn new(
        store: Arc<dyn DefinitionStore>,
        dispatcher: NodeDispatcher,
        human: Arc<HumanInputBroker>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                dispatcher: Arc::new(dispatcher),
                human,
                event_bus,
                config,
                runs: RwLock::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                seq: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start the processing loop. Runs until `shutdown`.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(process_loop(inner))
    }

    /// Stop the processing loop. In-flight runs drain cooperatively.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Submit a run for a stored workflow. The definition is validated
    /// first; a definition with hard errors is refused.
    pub async fn submit(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
        options: RunOptions,
    ) -> Result<RunId> {
        let definition = self.inner.store.load(workflow_id).await?;
        self.submit_definition(definition, input, options).await
    }

    /// Submit a run for an inline definition.
    pub async fn submit_definition(
        &self,
        definition: WorkflowDefinition,
        input: serde_json::Value,
        options: RunOptions,
    ) -> Result<RunId> {
        let report = validator::validate(&definition);
        if !report.valid {
            return Err(SkeinError::Validation(report.errors.join("; ")));
        }
        for warning in &report.warnings {
            warn!(workflow_id = %definition.id, warning = %warning, "Workflow validation warning");
        }

        let run_id = RunId::new();
        let session_id = options.session_id.unwrap_or_default();
        let timeout_secs = options
            .timeout_secs
            .or(definition.settings.timeout_secs)
            .unwrap_or(self.inner.config.run.timeout_secs);

        let records = definition
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeExecutionRecord::pending(&n.id)))
            .collect();

        let run = WorkflowRun {
            id: run_id.clone(),
            workflow_id: definition.id.clone(),
            status: RunStatus::Pending,
            priority: options.priority,
            input,
            output: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            session_id,
            submitter: options.submitter,
            organization: options.organization,
            records,
            summary: None,
        };

        let (control, _) = watch::channel(RunControl::Run);
        let slot = RunSlot {
            run,
            definition: Arc::new(definition),
            control,
            timeout_secs,
        };

        self.inner.runs.write().await.insert(run_id.0.clone(), slot);
        self.inner.queue.lock().await.push(QueuedRun {
            priority: options.priority,
            seq: self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst),
            run_id: run_id.clone(),
        });
        self.inner.notify.notify_one();

        info!(run_id = %run_id, priority = ?options.priority, "Run submitted");
        Ok(run_id)
    }

    /// Cooperative cancellation: queued runs terminate immediately,
    /// running ones finish their in-flight node and stop before the next.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        let was_pending = {
            let mut runs = self.inner.runs.write().await;
            let slot = runs
                .get_mut(&run_id.0)
                .ok_or_else(|| SkeinError::RunNotFound(run_id.to_string()))?;
            if slot.run.status.is_terminal() {
                return Ok(());
            }
            let was_pending = slot.run.status == RunStatus::Pending;
            if was_pending {
                slot.run.status = RunStatus::Cancelled;
                slot.run.finished_at = Some(Utc::now());
                slot.run.summary = Some(RunSummary::from_records(&slot.run.records));
            } else {
                slot.control.send_replace(RunControl::Cancel);
            }
            was_pending
        };

        self.inner.human.cancel_run(run_id).await;
        self.inner.event_bus.publish(EngineEvent::RunCancelled {
            run_id: run_id.clone(),
        });
        if was_pending {
            self.inner.event_bus.publish(EngineEvent::RunCompleted {
                run_id: run_id.clone(),
                status: RunStatus::Cancelled,
                duration_ms: 0,
            });
        }
        info!(run_id = %run_id, "Run cancelled");
        Ok(())
    }

    /// Pause a running run before its next node dispatch.
    pub async fn pause_run(&self, run_id: &RunId) -> Result<()> {
        let mut runs = self.inner.runs.write().await;
        let slot = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| SkeinError::RunNotFound(run_id.to_string()))?;
        if slot.run.status != RunStatus::Running {
            return Err(SkeinError::Validation(format!(
                "run {} is not running",
                run_id
            )));
        }
        slot.run.status = RunStatus::Paused;
        slot.control.send_replace(RunControl::Pause);
        info!(run_id = %run_id, "Run paused");
        Ok(())
    }

    /// Resume a paused run.
    pub async fn resume_run(&self, run_id: &RunId) -> Result<()> {
        let mut runs = self.inner.runs.write().await;
        let slot = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| SkeinError::RunNotFound(run_id.to_string()))?;
        if slot.run.status != RunStatus::Paused {
            return Err(SkeinError::Validation(format!(
                "run {} is not paused",
                run_id
            )));
        }
        slot.run.status = RunStatus::Running;
        slot.control.send_replace(RunControl::Run);
        info!(run_id = %run_id, "Run resumed");
        Ok(())
    }

    /// Deliver a human-input response to a waiting node.
    pub async fn provide_human_input(
        &self,
        run_id: &RunId,
        node_id: &str,
        value: serde_json::Value,
        responder_id: Option<String>,
    ) -> Result<()> {
        if !self.inner.runs.read().await.contains_key(&run_id.0) {
            return Err(SkeinError::RunNotFound(run_id.to_string()));
        }
        if self
            .inner
            .human
            .respond(run_id, node_id, value, responder_id)
            .await
        {
            Ok(())
        } else {
            Err(SkeinError::Validation(format!(
                "no pending human input for node '{}' of run {}",
                node_id, run_id
            )))
        }
    }

    /// Every terminal state is observable here; no run silently
    /// disappears.
    pub async fn get_run(&self, run_id: &RunId) -> Result<WorkflowRun> {
        self.inner
            .runs
            .read()
            .await
            .get(&run_id.0)
            .map(|slot| slot.run.clone())
            .ok_or_else(|| SkeinError::RunNotFound(run_id.to_string()))
    }

    /// Runs of a workflow, newest first.
    pub async fn run_history(&self, workflow_id: &str, filter: HistoryFilter) -> Vec<WorkflowRun> {
        let runs = self.inner.runs.read().await;
        let mut matches: Vec<WorkflowRun> = runs
            .values()
            .filter(|slot| slot.run.workflow_id == workflow_id)
            .filter(|slot| filter.status.map_or(true, |s| slot.run.status == s))
            .map(|slot| slot.run.clone())
            .collect();
        matches.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }
        matches
    }

    /// Pending human-input requests across all runs.
    pub async fn pending_human_inputs(&self) -> Vec<crate::human_input::HumanRequest> {
        self.inner.human.pending_requests().await
    }
}

async fn process_loop(inner: Arc<Inner>) {
    info!("Workflow coordinator started");
    loop {
        // Drain the queue in priority order; only one run is started at
        // a time from here.
        loop {
            let next = { inner.queue.lock().await.pop() };
            let Some(queued) = next else { break };
            start_run(&inner, queued).await;
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => {
                info!("Workflow coordinator shutting down");
                return;
            }
            _ = inner.notify.notified() => {}
        }
    }
}

async fn start_run(inner: &Arc<Inner>, queued: QueuedRun) {
    let claim = {
        let mut runs = inner.runs.write().await;
        match runs.get_mut(&queued.run_id.0) {
            Some(slot) if slot.run.status == RunStatus::Pending => {
                slot.run.status = RunStatus::Running;
                slot.run.started_at = Some(Utc::now());
                Some((
                    slot.definition.clone(),
                    slot.run.input.clone(),
                    slot.run.session_id.clone(),
                    slot.run.submitter.clone(),
                    slot.run.organization.clone(),
                    slot.control.subscribe(),
                    slot.timeout_secs,
                ))
            }
            // Cancelled while queued, or gone
            _ => None,
        }
    };

    let Some((definition, input, session, submitter, organization, control_rx, timeout_secs)) =
        claim
    else {
        return;
    };

    inner.event_bus.publish(EngineEvent::RunStarted {
        run_id: queued.run_id.clone(),
    });
    info!(run_id = %queued.run_id, workflow_id = %definition.id, "Run started");

    let inner = inner.clone();
    let run_id = queued.run_id;
    tokio::spawn(async move {
        execute_run(
            inner,
            run_id,
            definition,
            input,
            session,
            submitter,
            organization,
            control_rx,
            timeout_secs,
        )
        .await;
    });
}

enum DriveEnd {
    Completed,
    Aborted,
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn execute_run(
    inner: Arc<Inner>,
    run_id: RunId,
    definition: Arc<WorkflowDefinition>,
    input: serde_json::Value,
    session: SessionId,
    submitter: Option<String>,
    organization: Option<String>,
    control_rx: watch::Receiver<RunControl>,
    timeout_secs: u64,
) {
    let scheduler = match DependencyScheduler::new(&definition) {
        Ok(s) => s,
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Scheduling failed");
            finalize(&inner, &run_id, RunStatus::Failed, Some(e.to_string())).await;
            return;
        }
    };

    let retry_policy = match definition.settings.error_mode {
        ErrorMode::Retry => Some(RetryPolicy::from_config(
            definition
                .settings
                .retry
                .as_ref()
                .unwrap_or(&inner.config.retry),
        )),
        _ => None,
    };

    let tool_ctx = ToolCallContext {
        session_id: Some(session.clone()),
        user_id: submitter,
        organization_id: organization,
    };

    let mut ctx = ExecutionContext::new();
    ctx.set_variable("input", input.clone());

    let drive: BoxFuture<'_, DriveEnd> = Box::pin(drive_run(
        &inner,
        &run_id,
        &definition,
        &scheduler,
        &input,
        &session,
        &tool_ctx,
        retry_policy.as_ref(),
        control_rx,
        &mut ctx,
    ));

    match tokio::time::timeout(Duration::from_secs(timeout_secs), drive).await {
        Ok(DriveEnd::Completed) => {
            finalize(&inner, &run_id, RunStatus::Completed, None).await;
        }
        Ok(DriveEnd::Aborted) => {
            finalize(&inner, &run_id, RunStatus::Failed, None).await;
        }
        Ok(DriveEnd::Cancelled) => {
            finalize(&inner, &run_id, RunStatus::Cancelled, None).await;
        }
        Err(_) => {
            warn!(run_id = %run_id, timeout_secs, "Run timed out");
            finalize(
                &inner,
                &run_id,
                RunStatus::Failed,
                Some(SkeinError::RunTimeout(timeout_secs).to_string()),
            )
            .await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_run(
    inner: &Arc<Inner>,
    run_id: &RunId,
    definition: &WorkflowDefinition,
    scheduler: &DependencyScheduler,
    input: &serde_json::Value,
    session: &SessionId,
    tool_ctx: &ToolCallContext,
    retry_policy: Option<&RetryPolicy>,
    mut control_rx: watch::Receiver<RunControl>,
    ctx: &mut ExecutionContext,
) -> DriveEnd {
    let error_mode = definition.settings.error_mode;
    let mut records: HashMap<String, NodeExecutionRecord> = definition
        .nodes
        .iter()
        .map(|n| (n.id.clone(), NodeExecutionRecord::pending(&n.id)))
        .collect();
    let mut aborted = false;

    for node_id in scheduler.order() {
        // Cooperative control gate: the status flag is checked before
        // each dispatch; in-flight work is never forcibly aborted.
        loop {
            let state = *control_rx.borrow();
            match state {
                RunControl::Cancel => return DriveEnd::Cancelled,
                RunControl::Run => break,
                RunControl::Pause => {
                    if control_rx.changed().await.is_err() {
                        return DriveEnd::Cancelled;
                    }
                }
            }
        }

        if aborted {
            skip_node(inner, run_id, &mut records, node_id).await;
            continue;
        }

        match scheduler.admit(node_id, &records, error_mode, ctx.variables()) {
            Admission::Ready => {
                let Some(node) = definition.node(node_id) else {
                    skip_node(inner, run_id, &mut records, node_id).await;
                    continue;
                };
                let node_input = scheduler.gather_input(node_id, &records, input, ctx.variables());

                mark_running(inner, run_id, node_id).await;
                inner.event_bus.publish(EngineEvent::NodeStarted {
                    run_id: run_id.clone(),
                    node_id: node_id.clone(),
                });

                let execute_fut: BoxFuture<'_, NodeExecutionRecord> =
                    Box::pin(inner.dispatcher.execute(
                        run_id,
                        session,
                        node,
                        node_input,
                        ctx,
                        tool_ctx,
                        retry_policy,
                        definition.settings.max_concurrency,
                    ));
                let record = execute_fut.await;

                inner.event_bus.publish(EngineEvent::NodeCompleted {
                    run_id: run_id.clone(),
                    node_id: node_id.clone(),
                    status: record.status,
                });

                let failed = record.status == NodeStatus::Failed;
                records.insert(node_id.clone(), record.clone());
                store_record(inner, run_id, record).await;

                if failed && error_mode != ErrorMode::Continue {
                    aborted = true;
                }
            }
            Admission::Skip(reason) => {
                info!(run_id = %run_id, node_id = %node_id, reason = %reason, "Node skipped");
                skip_node(inner, run_id, &mut records, node_id).await;
            }
            Admission::Blocked => {
                // Unreachable in topological order; treat as a skip
                warn!(run_id = %run_id, node_id = %node_id, "Node blocked out of order, skipping");
                skip_node(inner, run_id, &mut records, node_id).await;
            }
        }
    }

    if aborted {
        DriveEnd::Aborted
    } else {
        DriveEnd::Completed
    }
}

async fn mark_running(inner: &Arc<Inner>, run_id: &RunId, node_id: &str) {
    let mut runs = inner.runs.write().await;
    if let Some(slot) = runs.get_mut(&run_id.0) {
        if let Some(record) = slot.run.records.get_mut(node_id) {
            record.status = NodeStatus::Running;
            record.started_at = Some(Utc::now());
        }
    }
}

async fn skip_node(
    inner: &Arc<Inner>,
    run_id: &RunId,
    records: &mut HashMap<String, NodeExecutionRecord>,
    node_id: &str,
) {
    let mut record = NodeExecutionRecord::pending(node_id);
    record.status = NodeStatus::Skipped;
    record.finished_at = Some(Utc::now());
    records.insert(node_id.to_string(), record.clone());

    inner.event_bus.publish(EngineEvent::NodeCompleted {
        run_id: run_id.clone(),
        node_id: node_id.to_string(),
        status: NodeStatus::Skipped,
    });
    store_record(inner, run_id, record).await;
}

async fn store_record(inner: &Arc<Inner>, run_id: &RunId, record: NodeExecutionRecord) {
    let mut runs = inner.runs.write().await;
    if let Some(slot) = runs.get_mut(&run_id.0) {
        slot.run.records.insert(record.node_id.clone(), record);
    }
}

async fn finalize(inner: &Arc<Inner>, run_id: &RunId, status: RunStatus, error: Option<String>) {
    let duration_ms = {
        let mut runs = inner.runs.write().await;
        let Some(slot) = runs.get_mut(&run_id.0) else {
            return;
        };
        let now = Utc::now();
        let run = &mut slot.run;
        run.status = status;
        run.finished_at = Some(now);
        run.error = error.or_else(|| {
            run.records
                .values()
                .find(|r| r.status == NodeStatus::Failed)
                .and_then(|r| r.error.clone())
        });
        run.summary = Some(RunSummary::from_records(&run.records));
        run.output = Some(compute_output(&slot.definition, &run.records));
        run.started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    };

    inner.human.cancel_run(run_id).await;
    inner.event_bus.publish(EngineEvent::RunCompleted {
        run_id: run_id.clone(),
        status,
        duration_ms,
    });
    info!(run_id = %run_id, %status, duration_ms, "Run finished");
}

/// The run's output: completed sink-node outputs, passed through
/// directly for a single sink and keyed by node id otherwise.
fn compute_output(
    definition: &WorkflowDefinition,
    records: &HashMap<String, NodeExecutionRecord>,
) -> serde_json::Value {
    let mut sinks: Vec<&str> = definition
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !definition.edges.iter().any(|e| e.source == *id))
        .collect();
    sinks.retain(|id| {
        records
            .get(*id)
            .map_or(false, |r| r.status == NodeStatus::Completed)
    });

    let mut outputs: Vec<(&str, serde_json::Value)> = sinks
        .into_iter()
        .map(|id| {
            (
                id,
                records
                    .get(id)
                    .and_then(|r| r.output.clone())
                    .unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();

    match outputs.len() {
        0 => serde_json::Value::Null,
        1 => outputs.remove(0).1,
        _ => {
            let mut map = serde_json::Map::new();
            for (id, output) in outputs {
                map.insert(id.to_string(), output);
            }
            serde_json::Value::Object(map)
        }
    }
}
