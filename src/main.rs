use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blockflow_core::config::AppConfig;
use blockflow_core::event::EventBus;
use blockflow_core::types::{FlowEvent, Outputs, RunContext};

use blockflow_engine::{
    build_connected_model, normalize_document, validate_edge, BlockRegistry, FlowDocument,
    GraphExecutor, RunOptions, RunReport, SubscriptionManager,
};

const DEFAULT_CONFIG: &str = "blockflow.toml";

#[derive(Parser)]
#[command(name = "blockflow", version, about = "Run visual DeFi automation agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical form of a saved flow
    Normalize {
        /// Flow JSON file
        flow: PathBuf,
    },
    /// Report connection verdicts and what normalization drops
    Check {
        /// Flow JSON file
        flow: PathBuf,
    },
    /// Run a flow once from a node with synthetic trigger outputs
    Run {
        /// Flow JSON file
        flow: PathBuf,
        /// Node to start from
        #[arg(long)]
        from: String,
        /// Trigger output, as key=value (repeatable)
        #[arg(long = "set", value_parser = parse_key_val)]
        set: Vec<(String, String)>,
    },
    /// Keep the flow's triggers subscribed until Ctrl-C
    Watch {
        /// Flow JSON file
        flow: PathBuf,
        /// Agent id used in logs and events
        #[arg(long, default_value = "default")]
        agent: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    Ok((k.trim().to_string(), v.to_string()))
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    // Only the default path may be absent.
    let config = if path == Path::new(DEFAULT_CONFIG) {
        AppConfig::load_or_default(path)?
    } else {
        AppConfig::load(path)?
    };
    Ok(config)
}

fn init_tracing(config: &AppConfig) {
    let fallback = config
        .log
        .as_ref()
        .and_then(|l| l.filter.clone())
        .unwrap_or_else(|| "blockflow=info,warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .init();
}

fn load_flow(path: &Path) -> anyhow::Result<FlowDocument> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading flow {}", path.display()))?;
    Ok(FlowDocument::from_json(&text)?)
}

fn run_context(config: &AppConfig) -> RunContext {
    match config.wallet_address() {
        Some(address) => RunContext::new().with_wallet(address),
        None => RunContext::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config);

    let registry = Arc::new(blockflow_blocks::builtin_registry());

    match cli.command {
        Commands::Normalize { flow } => {
            let doc = load_flow(&flow)?;
            let canonical = normalize_document(&registry, &doc);
            println!("{}", canonical.to_json_pretty()?);
        }
        Commands::Check { flow } => {
            let doc = load_flow(&flow)?;
            check(&registry, &doc);
        }
        Commands::Run { flow, from, set } => {
            let doc = load_flow(&flow)?;
            let graph = build_connected_model(&registry, &doc.nodes, &doc.edges);
            let executor = GraphExecutor::new(registry.clone(), config.engine.clone());
            let trigger_outputs: Outputs = set.into_iter().collect();
            let options = RunOptions::new().with_event_bus(Arc::new(EventBus::default()));

            let report = executor
                .run_downstream(&graph, &from, trigger_outputs, &run_context(&config), &options)
                .await?;
            print_report(&report)?;
            if !report.succeeded {
                warn!(failed = report.failed(), "Run finished with failures");
            }
        }
        Commands::Watch { flow, agent } => {
            let doc = load_flow(&flow)?;
            let graph = Arc::new(build_connected_model(&registry, &doc.nodes, &doc.edges));
            let event_bus = Arc::new(EventBus::default());
            let executor = Arc::new(GraphExecutor::new(registry.clone(), config.engine.clone()));
            let manager =
                SubscriptionManager::new(executor, config.subscriptions.clone(), event_bus.clone());

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down...");
                cancel_clone.cancel();
            });

            // Live updates to stdout
            let mut events = event_bus.subscribe();
            let printer_cancel = cancel.clone();
            let printer = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = printer_cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(FlowEvent::NodeOutput { node_id, outputs_json, .. }) => {
                                println!("{}\t{}", node_id, outputs_json);
                            }
                            Ok(FlowEvent::NodeFailed { node_id, error, .. }) => {
                                eprintln!("{}\tfailed: {}", node_id, error);
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Event printer lagged");
                            }
                            Err(_) => break,
                        },
                    }
                }
            });

            let listeners = manager.activate(&agent, graph, run_context(&config)).await;
            if listeners == 0 {
                warn!(agent_id = %agent, "Flow has no subscribable triggers, nothing to watch");
                cancel.cancel();
            } else {
                info!(agent_id = %agent, listeners, "Watching agent, Ctrl-C to stop");
            }

            cancel.cancelled().await;
            manager.deactivate_all().await;
            printer.await.ok();
        }
    }

    Ok(())
}

fn check(registry: &BlockRegistry, doc: &FlowDocument) {
    for edge in &doc.edges {
        let verdict = validate_edge(registry, &doc.nodes, edge);
        let id = if edge.id.is_empty() { "<no id>" } else { edge.id.as_str() };
        match verdict.reason {
            Some(reason) if !verdict.valid => {
                println!("edge {} ({} -> {}): rejected: {}", id, edge.source, edge.target, reason)
            }
            _ => println!("edge {} ({} -> {}): ok", id, edge.source, edge.target),
        }
    }

    let canonical = normalize_document(registry, doc);
    println!(
        "nodes: {} -> {}, edges: {} -> {}",
        doc.nodes.len(),
        canonical.nodes.len(),
        doc.edges.len(),
        canonical.edges.len()
    );
    for node in &canonical.nodes {
        if registry.definition(&node.block_type).is_none() {
            println!("node {}: block type '{}' is not registered", node.id, node.block_type);
        }
        for (field, src) in &node.input_sources {
            println!(
                "node {}: {} <- {}.{}",
                node.id, field, src.source_node_id, src.output_name
            );
        }
    }
}

fn print_report(report: &RunReport) -> anyhow::Result<()> {
    println!("run {} from {}", report.run_id, report.start_node);
    for result in &report.node_results {
        let outputs = report
            .outputs
            .outputs(&result.node_id)
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_default();
        match result.error {
            Some(ref e) => println!(
                "  {:<16} {:?} ({}ms): {}",
                result.node_id, result.status, result.elapsed_ms, e
            ),
            None => println!(
                "  {:<16} {:?} ({}ms) {}",
                result.node_id, result.status, result.elapsed_ms, outputs
            ),
        }
    }
    println!(
        "{} executed, {} failed, {}ms",
        report.executed(),
        report.failed(),
        report.total_elapsed_ms
    );
    Ok(())
}
