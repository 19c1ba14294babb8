use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use waterflow_core::{ExecutionEvent, FitableInvoker, FlowContextStatus, NodeExecutor};
use waterflow_nodes::{HttpFitableInvoker, LocalFitables};
use waterflow_runtime::{
    DefinitionLoader, ExecutorRegistry, FlowRuntime, RetryScheduler, RuntimeConfig,
};

#[derive(Parser)]
#[command(name = "waterflow")]
#[command(about = "Waterflow CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow definition file once
    Run {
        /// Path to definition JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Business data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Operator recorded on every context
        #[arg(long)]
        operator: Option<String>,

        /// Base URL of the fitable service (defaults to FITABLE_BASE_URL)
        #[arg(long)]
        fitables: Option<String>,

        /// Keep retrying RETRYABLE contexts until none is left
        #[arg(long)]
        wait_retries: bool,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a definition file
    Validate {
        /// Path to definition JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create an example definition
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            operator,
            fitables,
            wait_retries,
            verbose,
        } => {
            use tracing_subscriber::{fmt, EnvFilter};
            let level = if verbose { "debug" } else { "info" };
            fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
                )
                .init();

            let base_url = fitables.or_else(|| std::env::var("FITABLE_BASE_URL").ok());
            run_flow(file, input, operator, base_url, wait_retries).await?;
        }

        Commands::Validate { file } => {
            validate_flow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_flow(output)?;
        }
    }

    Ok(())
}

fn build_runtime(invoker: Arc<dyn FitableInvoker>) -> FlowRuntime {
    let mut registry = ExecutorRegistry::new();
    waterflow_nodes::register_all(&mut registry, invoker.clone());
    FlowRuntime::with_registry(Arc::new(registry), invoker, RuntimeConfig::from_env())
}

async fn run_flow(
    file: PathBuf,
    input: Option<String>,
    operator: Option<String>,
    base_url: Option<String>,
    wait_retries: bool,
) -> Result<()> {
    println!("Loading definition from: {}", file.display());
    let definition = DefinitionLoader::load_file(&file)?;

    println!("Stream: {} ({})", definition.stream_id(), definition.name);
    println!("   Nodes: {}", definition.nodes.len());
    println!();

    let data: serde_json::Value = match input {
        Some(raw) => serde_json::from_str(&raw).context("input is not valid JSON")?,
        None => json!({}),
    };

    let invoker: Arc<dyn FitableInvoker> = match base_url {
        Some(url) => Arc::new(HttpFitableInvoker::new(url)),
        None => Arc::new(LocalFitables::new()),
    };
    let runtime = build_runtime(invoker);
    let stream_id = runtime.register(definition).await;

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::TraceStarted { trace_id, .. } => {
                    println!("Trace {} started", trace_id);
                }
                ExecutionEvent::ContextTransitioned { position, from, to, .. } => match from {
                    Some(from) => println!("  {:<16} {} -> {}", position, from, to),
                    None => println!("  {:<16} {}", position, to),
                },
                ExecutionEvent::ContextResumed { position, .. } => {
                    println!("  {:<16} resumed", position);
                }
                ExecutionEvent::RetryScheduled { position, retry_count, next_retry_time, .. } => {
                    println!(
                        "  {:<16} retry #{} at {}",
                        position,
                        retry_count + 1,
                        next_retry_time
                    );
                }
                ExecutionEvent::TraceFinished { position, .. } => {
                    println!("Trace finished at {}", position);
                }
            }
        }
    });

    let trace_id = runtime.start(&stream_id, data, operator).await?;

    if wait_retries {
        let scheduler = RetryScheduler::new(runtime.clone());
        let interval = runtime.config().scheduler_interval;
        loop {
            let retryable = runtime
                .contexts_by_trace(trace_id)
                .await?
                .iter()
                .any(|c| c.status == FlowContextStatus::Retryable);
            if !retryable {
                break;
            }
            tokio::time::sleep(interval).await;
            scheduler.tick().await;
        }
    }

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("Contexts of trace {}:", trace_id);
    for context in runtime.contexts_by_trace(trace_id).await? {
        println!("   {:<16} {:<10} {}", context.position, context.status, context.data);
        if let Some(error) = &context.error {
            println!("      error: {}", error);
        }
    }

    Ok(())
}

fn validate_flow(file: PathBuf) -> Result<()> {
    println!("Validating definition: {}", file.display());

    let definition = DefinitionLoader::load_file(&file)?;

    println!("Definition is valid:");
    println!("   Stream: {}", definition.stream_id());
    println!("   Start: {}", definition.start_node);
    let mut nodes: Vec<_> = definition.nodes.values().collect();
    nodes.sort_by(|a, b| a.meta_id.cmp(&b.meta_id));
    for node in nodes {
        let targets: Vec<&str> = node.events.iter().map(|e| e.to.as_str()).collect();
        println!(
            "   {} ({}) -> [{}]",
            node.meta_id,
            node.node_type(),
            targets.join(", ")
        );
    }

    Ok(())
}

fn list_nodes() {
    println!("Available node types:");
    println!();

    let mut registry = ExecutorRegistry::new();
    waterflow_nodes::register_all(&mut registry, Arc::new(LocalFitables::new()));

    for node_type in registry.list_node_types() {
        match registry.get(node_type) {
            Some(executor) => println!("  {:<12} {}", node_type, executor.description()),
            None => println!("  {}", node_type),
        }
    }
}

fn create_example_flow(output: PathBuf) -> Result<()> {
    let definition = json!({
        "metaId": "order-review",
        "version": "1.0.0",
        "name": "Order review",
        "description": "Scores an order, auto-approves small ones and asks a reviewer otherwise",
        "nodes": [
            {"metaId": "start", "type": "start"},
            {"metaId": "score", "name": "score order", "type": "state",
             "jober": {"fitables": ["score-order"], "converter": "key:score"}},
            {"metaId": "route", "type": "condition",
             "branches": [{"rule": "amount < 100"}]},
            {"metaId": "review", "name": "manual review", "type": "manualTask"},
            {"metaId": "end", "type": "end"}
        ],
        "events": [
            {"from": "start", "to": "score"},
            {"from": "score", "to": "route"},
            {"from": "route", "to": "end"},
            {"from": "route", "to": "review"},
            {"from": "review", "to": "end"}
        ]
    });

    // Refuse to write something the parser would reject
    waterflow_core::parser::parse_value(definition.clone())?;

    std::fs::write(&output, serde_json::to_string_pretty(&definition)?)?;

    println!("Created example definition: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  waterflow run --file {} --fitables http://localhost:8080 --input '{{\"amount\": 42}}'",
        output.display()
    );

    Ok(())
}
