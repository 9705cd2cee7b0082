use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skein_core::config::EngineConfig;
use skein_core::event::{EngineEvent, EventBus};
use skein_core::traits::AgentInvoker;
use skein_core::types::{AgentReply, Priority, SessionId};
use skein_engine::coordinator::{InMemoryDefinitionStore, RunOptions, WorkflowCoordinator};
use skein_engine::dispatcher::NodeDispatcher;
use skein_engine::graph::{validator, DependencyScheduler, WorkflowDefinition};
use skein_engine::human_input::HumanInputBroker;
use skein_tools::{
    CircuitBreaker, FunctionBackend, RestBackend, RetryPolicy, ToolInvoker, ToolMetrics,
    ToolRegistry,
};

#[derive(Parser)]
#[command(name = "skein", version, about = "Hybrid workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "skein.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition file
    Validate {
        /// Workflow definition (JSON)
        file: PathBuf,
    },
    /// Print the topological execution order of a definition
    Order {
        /// Workflow definition (JSON)
        file: PathBuf,
    },
    /// Execute a workflow definition to completion
    Run {
        /// Workflow definition (JSON)
        file: PathBuf,
        /// JSON input payload for the run
        #[arg(long, default_value = "{}")]
        input: String,
        /// Run priority (low|normal|high|critical)
        #[arg(long, default_value = "normal")]
        priority: String,
    },
}

/// The CLI has no agent capability wired in; agent nodes fail cleanly.
struct UnconfiguredAgent;

impl AgentInvoker for UnconfiguredAgent {
    fn invoke(
        &self,
        agent_id: String,
        _input: serde_json::Value,
        _session: SessionId,
    ) -> futures::future::BoxFuture<'_, skein_core::error::Result<AgentReply>> {
        Box::pin(async move {
            Err(skein_core::error::SkeinError::AgentExecution {
                agent: agent_id,
                message: "no agent capability configured for the CLI".to_string(),
            })
        })
    }
}

fn load_definition(path: &PathBuf) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skein=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)?
    } else {
        EngineConfig::default()
    };

    match cli.command {
        Commands::Validate { file } => {
            let definition = load_definition(&file)?;
            let report = validator::validate(&definition);
            for error in &report.errors {
                println!("error: {}", error);
            }
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
            if report.valid {
                println!("{}: valid", definition.id);
                Ok(())
            } else {
                anyhow::bail!("{}: invalid definition", definition.id);
            }
        }
        Commands::Order { file } => {
            let definition = load_definition(&file)?;
            let report = validator::validate(&definition);
            if !report.valid {
                anyhow::bail!("invalid definition: {}", report.errors.join("; "));
            }
            let scheduler = DependencyScheduler::new(&definition)?;
            for (i, node_id) in scheduler.order().iter().enumerate() {
                println!("{:>3}. {}", i + 1, node_id);
            }
            Ok(())
        }
        Commands::Run {
            file,
            input,
            priority,
        } => {
            let definition = load_definition(&file)?;
            let input: serde_json::Value = serde_json::from_str(&input)?;
            let priority: Priority = priority.parse()?;
            run_workflow(config, definition, input, priority).await
        }
    }
}

async fn run_workflow(
    config: EngineConfig,
    definition: WorkflowDefinition,
    input: serde_json::Value,
    priority: Priority,
) -> anyhow::Result<()> {
    let event_bus = Arc::new(EventBus::new(config.run.event_capacity));
    let cancel = CancellationToken::new();

    let mut registry = ToolRegistry::new();
    registry.register_backend(Arc::new(FunctionBackend::new()));
    registry.register_backend(Arc::new(RestBackend::new()));

    let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), event_bus.clone()));
    tokio::spawn(breaker.clone().sweep_loop(cancel.clone()));

    let invoker = Arc::new(ToolInvoker::new(
        Arc::new(tokio::sync::RwLock::new(registry)),
        breaker,
        Arc::new(ToolMetrics::new()),
        RetryPolicy::from_config(&config.retry),
        event_bus.clone(),
    ));

    let human = Arc::new(HumanInputBroker::new(event_bus.clone()));
    let dispatcher = NodeDispatcher::new(
        Arc::new(UnconfiguredAgent),
        invoker,
        human.clone(),
        config.run.clone(),
    );

    let coordinator = WorkflowCoordinator::new(
        Arc::new(InMemoryDefinitionStore::new()),
        dispatcher,
        human,
        event_bus.clone(),
        config,
    );

    let mut events = event_bus.subscribe();
    let loop_handle = coordinator.start();

    let run_id = coordinator
        .submit_definition(
            definition,
            input,
            RunOptions {
                priority,
                ..Default::default()
            },
        )
        .await?;
    info!(run_id = %run_id, "Run submitted");

    // Follow the run on the event channel until it finishes
    loop {
        match events.recv().await {
            Ok(EngineEvent::NodeCompleted {
                run_id: rid,
                node_id,
                status,
            }) if rid == run_id => {
                println!("node {}: {}", node_id, status);
            }
            Ok(EngineEvent::HumanInputRequired { node_id, prompt, .. }) => {
                println!("human input required at '{}': {}", node_id, prompt);
            }
            Ok(EngineEvent::RunCompleted {
                run_id: rid,
                status,
                duration_ms,
            }) if rid == run_id => {
                println!("run {}: {} in {}ms", rid, status, duration_ms);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Event channel closed");
                break;
            }
        }
    }

    let run = coordinator.get_run(&run_id).await?;
    if let Some(summary) = &run.summary {
        println!(
            "nodes: {} total, {} completed, {} failed, {} skipped",
            summary.total, summary.completed, summary.failed, summary.skipped
        );
    }
    if let Some(output) = &run.output {
        println!("output: {}", serde_json::to_string_pretty(output)?);
    }
    if let Some(error) = &run.error {
        println!("error: {}", error);
    }

    coordinator.shutdown();
    cancel.cancel();
    let _ = loop_handle.await;

    if run.status == skein_core::types::RunStatus::Completed {
        Ok(())
    } else {
        anyhow::bail!("run finished as {}", run.status);
    }
}
