use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use gyre_engine::{
    Checkpoint, CheckpointSink, Engine, EngineConfig, EngineError, EngineEvent, EngineEventSink,
    EngineStatus, engine_event_channel,
};
use gyre_graph::{Diagnostic, Severity, canonicalize_source, prepare};
use gyre_llm::{HttpModelProvider, ModelConfig, ProviderRegistry, ScriptedProvider};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "gyre")]
#[command(about = "Attractor graph tooling: lint, canonicalize, and run")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse, apply the model stylesheet, and report diagnostics.
    Lint(GraphInput),
    /// Print the canonical form whose digest the store records.
    Canonicalize(GraphInput),
    /// Execute a graph locally with a scripted (or HTTP) model provider.
    Run(RunArgs),
    /// Pretty-print a checkpoint file written by `run`.
    InspectCheckpoint(InspectArgs),
}

#[derive(clap::Args, Debug)]
struct GraphInput {
    #[arg(long)]
    dot_file: Option<PathBuf>,
    #[arg(long)]
    dot_source: Option<String>,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    input: GraphInput,
    #[arg(long, default_value = "local-run")]
    run_id: String,
    #[arg(long, default_value = "anthropic")]
    provider: String,
    #[arg(long, default_value = "claude-sonnet-4-5")]
    model: String,
    /// Write a checkpoint file after every step.
    #[arg(long)]
    checkpoint_out: Option<PathBuf>,
    /// Resume from a checkpoint file written by a previous run.
    #[arg(long)]
    resume_from: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct InspectArgs {
    #[arg(long)]
    checkpoint: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Lint(input) => lint_command(input).await,
        Commands::Canonicalize(input) => canonicalize_command(input).await,
        Commands::Run(args) => run_command(args).await,
        Commands::InspectCheckpoint(args) => inspect_command(args).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn load_source(input: &GraphInput) -> Result<String, String> {
    match (&input.dot_file, &input.dot_source) {
        (Some(path), None) => tokio::fs::read_to_string(path)
            .await
            .map_err(|error| format!("failed to read '{}': {error}", path.display())),
        (None, Some(source)) => Ok(source.clone()),
        _ => Err("provide exactly one of --dot-file or --dot-source".to_string()),
    }
}

async fn lint_command(input: GraphInput) -> Result<ExitCode, String> {
    let source = load_source(&input).await?;
    let (_, diagnostics) = prepare(&source).map_err(|error| error.to_string())?;

    if diagnostics.is_empty() {
        println!("ok: no diagnostics");
        return Ok(ExitCode::SUCCESS);
    }
    for diagnostic in &diagnostics {
        println!("{}", render_diagnostic(diagnostic));
    }
    if diagnostics.iter().any(Diagnostic::is_error) {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn render_diagnostic(diagnostic: &Diagnostic) -> String {
    let severity = match diagnostic.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "info",
    };
    let mut line = format!("{severity}[{}]: {}", diagnostic.rule, diagnostic.message);
    if let Some(node_id) = &diagnostic.node_id {
        line.push_str(&format!(" (node '{node_id}')"));
    }
    if let Some((from, to)) = &diagnostic.edge {
        line.push_str(&format!(" (edge {from} -> {to})"));
    }
    line
}

async fn canonicalize_command(input: GraphInput) -> Result<ExitCode, String> {
    let source = load_source(&input).await?;
    let canonical = canonicalize_source(&source).map_err(|error| error.to_string())?;
    print!("{canonical}");
    Ok(ExitCode::SUCCESS)
}

struct FileCheckpointSink {
    path: PathBuf,
}

#[async_trait]
impl CheckpointSink for FileCheckpointSink {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|error| EngineError::Runtime(error.to_string()))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|error| {
                EngineError::Runtime(format!(
                    "failed writing checkpoint '{}': {error}",
                    self.path.display()
                ))
            })
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let source = load_source(&args.input).await?;
    let (graph, diagnostics) = prepare(&source).map_err(|error| error.to_string())?;
    for diagnostic in diagnostics.iter().filter(|d| !d.is_error()) {
        eprintln!("{}", render_diagnostic(diagnostic));
    }

    let model_config = ModelConfig {
        provider: args.provider.clone(),
        model: args.model.clone(),
        temperature: None,
        max_tokens: None,
        reasoning: None,
    };
    let mut config = EngineConfig::new(args.run_id.clone(), model_config);
    config.providers = build_providers(&args.provider);
    if let Some(path) = &args.checkpoint_out {
        config.checkpoints = Arc::new(FileCheckpointSink { path: path.clone() });
    }

    let (sender, mut receiver) = engine_event_channel();
    config.events = EngineEventSink::with_sender(sender);
    let event_json = args.event_json;
    let printer = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            print_event(&event, event_json);
        }
    });

    let resume = match &args.resume_from {
        Some(path) => Some(read_checkpoint(path).await?),
        None => None,
    };

    let engine = Engine::new(graph, config);
    let result = engine.run(resume).await.map_err(|error| error.to_string())?;
    drop(engine);
    let _ = printer.await;

    match result.status {
        EngineStatus::Succeeded => {
            println!("status: success");
            if let Some(final_node) = result.final_node {
                println!("final_node: {final_node}");
            }
            Ok(ExitCode::SUCCESS)
        }
        EngineStatus::Failed => {
            println!("status: fail");
            if let Some(reason) = result.failure_reason {
                println!("reason: {reason}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

/// HTTP provider when endpoint and key are configured, scripted echo
/// otherwise.
fn build_providers(provider_name: &str) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    match (
        std::env::var("GYRE_MODEL_ENDPOINT"),
        std::env::var("GYRE_MODEL_API_KEY"),
    ) {
        (Ok(endpoint), Ok(api_key)) => {
            registry.register(Arc::new(HttpModelProvider::new(
                provider_name,
                endpoint,
                api_key,
            )));
        }
        _ => {
            registry.register(Arc::new(ScriptedProvider::echoing(provider_name)));
        }
    }
    registry
}

fn print_event(event: &EngineEvent, as_json: bool) {
    if as_json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
    } else {
        println!("[{:>4}] {:?}", event.sequence_no, event.kind);
    }
}

async fn read_checkpoint(path: &Path) -> Result<Checkpoint, String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|error| format!("failed to read '{}': {error}", path.display()))?;
    serde_json::from_slice(&bytes)
        .map_err(|error| format!("malformed checkpoint '{}': {error}", path.display()))
}

async fn inspect_command(args: InspectArgs) -> Result<ExitCode, String> {
    let checkpoint = read_checkpoint(&args.checkpoint).await?;
    println!("run_id: {}", checkpoint.run_id);
    println!("step: {}", checkpoint.step);
    println!("current_node: {}", checkpoint.current_node_id);
    println!(
        "next_node: {}",
        checkpoint.next_node_id.as_deref().unwrap_or("-")
    );
    println!("completed_nodes: {}", checkpoint.state.completed_nodes.join(", "));
    Ok(ExitCode::SUCCESS)
}
