// SPDX-License-Identifier: MIT OR Apache-2.0
//! `nodeflow` - load a graph document and run or inspect it.
//!
//! Documents are read as RON when the file ends in `.ron` and as JSON
//! otherwise. Only the built-in node types are available.

use clap::{Parser, Subcommand};
use nodeflow_graph::nodes::basic::Watch;
use nodeflow_graph::{
    ConfigError, DocumentError, EngineConfig, EngineContext, Graph, GraphDocument, GraphError,
    GraphHooks,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run and inspect nodeflow graph documents
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Engine settings file (RON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a graph and run it for a number of steps
    Run {
        /// Graph document (.json or .ron)
        file: PathBuf,

        /// Steps to run
        #[arg(long, default_value_t = 1)]
        steps: usize,

        /// Fixed step length in seconds (wall clock if omitted)
        #[arg(long)]
        fixed_step: Option<f64>,

        /// Propagate node errors instead of logging them
        #[arg(long)]
        strict: bool,

        /// Print the graph document after running
        #[arg(long)]
        print: bool,
    },
    /// Load a graph and print its nodes and execution order
    Inspect {
        /// Graph document (.json or .ron)
        file: PathBuf,
    },
}

/// Prints graph-level events raised by the root graph
struct PrintEvents;

impl GraphHooks for PrintEvents {
    fn on_trigger(&mut self, event: &str, param: &Value) {
        println!("event {event}: {param}");
    }
}

fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Run {
            file,
            steps,
            fixed_step,
            strict,
            print,
        } => {
            if fixed_step.is_some() {
                config.fixed_time_step = fixed_step;
            }
            if strict {
                config.catch_errors = false;
            }
            let engine = EngineContext::with_builtin_nodes(config);
            let mut graph = load_graph(&engine, &file)?;
            graph.set_hooks(Box::new(PrintEvents));

            graph.start();
            for _ in 0..steps {
                graph.update()?;
            }
            graph.stop();
            tracing::info!(steps, iteration = graph.iteration(), "run finished");

            for id in graph.find_nodes_by_type(nodeflow_graph::nodes::basic::WATCH_TYPE) {
                if let Some(watch) = graph.behavior::<Watch>(id) {
                    let shown = watch.value().map_or_else(|| "-".to_string(), Value::to_string);
                    println!("watch {id}: {shown}");
                }
            }
            if print {
                println!("{}", graph.serialize().to_json_pretty()?);
            }
        }
        Command::Inspect { file } => {
            let engine = EngineContext::with_builtin_nodes(config);
            let mut graph = load_graph(&engine, &file)?;
            for node in graph.nodes() {
                println!(
                    "{:>6}  {:<20} {:<24} mode={}",
                    node.id().to_string(),
                    node.type_name(),
                    node.title,
                    node.mode().name()
                );
            }
            let order: Vec<String> = graph
                .execution_order()
                .iter()
                .map(ToString::to_string)
                .collect();
            println!("links: {}", graph.link_count());
            println!("order: {}", order.join(" -> "));
        }
    }
    Ok(())
}

fn load_graph(engine: &EngineContext, path: &Path) -> Result<Graph, CliError> {
    let source = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let doc = if path.extension().is_some_and(|ext| ext == "ron") {
        GraphDocument::from_ron(&source)?
    } else {
        GraphDocument::from_json(&source)?
    };

    let mut graph = engine.create_graph();
    let report = graph.configure(&doc, engine);
    for skipped in &report.skipped_nodes {
        tracing::warn!(node = %skipped.id, type_name = %skipped.type_name, "skipped unknown node type");
    }
    tracing::info!(path = %path.display(), nodes = graph.node_count(), "graph loaded");
    Ok(graph)
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
