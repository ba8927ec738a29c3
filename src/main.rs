use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use plexus_core::config::AppConfig;
use plexus_core::traits::ToolTransport;
use plexus_core::types::{Plan, Status};
use plexus_engine::Orchestrator;
use plexus_tools::{build_transport, run_stdio_worker, ServerRegistry, WorkerCommand};

#[derive(Parser)]
#[command(name = "plexus", version, about = "DAG plan executor with isolated tool workers")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "plexus.toml", env = "PLEXUS_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a plan and execute it to completion
    Run {
        /// Plan JSON file
        plan: PathBuf,
        /// Input query recorded with the run
        #[arg(long, short)]
        query: Option<String>,
    },
    /// Show a run's status, result and artifacts
    Status {
        run_id: String,
    },
    /// List a run's node records
    Nodes {
        run_id: String,
    },
    /// List recent runs
    Runs {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show aggregate ledger metrics
    Metrics,
    /// Fetch a server's tool manifest through the configured transport
    Manifest {
        server: String,
    },
    /// Call a single tool through the configured transport
    Call {
        server: String,
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Serve one built-in server over stdin/stdout
    Worker {
        server: String,
        /// Print the manifest and exit
        #[arg(long)]
        manifest: bool,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout carries command output and, in worker mode, protocol lines only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plexus=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "plexus", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let registry = Arc::new(ServerRegistry::with_builtins(&config.servers));

    match cli.command {
        Commands::Worker { server, manifest } => {
            let target = registry
                .get(&server)
                .with_context(|| format!("unknown server '{server}'"))?;
            run_stdio_worker(target.as_ref(), manifest).await?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => {}
        command => {
            let transport = build_transport(
                &config.transport,
                registry,
                Some(default_worker(&cli.config)?),
            );
            let orchestrator = Orchestrator::from_config(&config, transport.clone())?;
            run_command(command, &orchestrator, transport.as_ref()).await?;
        }
    }

    Ok(())
}

/// Workers default to this binary's `worker` subcommand with the same config.
fn default_worker(config_path: &Path) -> anyhow::Result<WorkerCommand> {
    let exe = std::env::current_exe().context("locating current executable")?;
    Ok(WorkerCommand::new(exe.display().to_string())
        .arg("--config")
        .arg(config_path.display().to_string())
        .arg("worker"))
}

async fn run_command(
    command: Commands,
    orchestrator: &Orchestrator,
    transport: &dyn ToolTransport,
) -> anyhow::Result<()> {
    match command {
        Commands::Run { plan, query } => {
            let raw = std::fs::read_to_string(&plan)
                .with_context(|| format!("reading plan {}", plan.display()))?;
            let plan: Plan = serde_json::from_str(&raw).context("parsing plan")?;
            let input_query = query.map(Value::String).unwrap_or(Value::Null);

            let run_id = orchestrator.submit(&plan, &input_query)?;
            info!(run_id = %run_id, "Executing plan");
            match orchestrator.execute(&run_id, &plan).await {
                Ok(result) => {
                    println!("run_id: {run_id}");
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Run failed");
                    print_report(orchestrator, &run_id)?;
                    return Err(e.into());
                }
            }
        }
        Commands::Status { run_id } => print_report(orchestrator, &run_id)?,
        Commands::Nodes { run_id } => {
            let nodes = orchestrator.get_nodes(&run_id)?;
            println!(
                "{:<16} {:<6} {:<8} {:>8}  OUTPUT",
                "NODE", "TYPE", "STATUS", "MS"
            );
            for node in nodes {
                let duration = node
                    .duration_ms()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".into());
                let output = node
                    .output_artifact
                    .or(node.error)
                    .unwrap_or_default();
                println!(
                    "{:<16} {:<6} {:<8} {:>8}  {}",
                    node.node_id, node.node_type, node.status.as_str(), duration, output
                );
            }
        }
        Commands::Runs { limit } => {
            for run in orchestrator.list_runs(limit)? {
                println!(
                    "{}  {:<8} {:<16} {}",
                    run.run_id,
                    run.status.as_str(),
                    run.plan_id,
                    run.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Metrics => {
            let metrics = orchestrator.get_metrics()?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Commands::Manifest { server } => {
            let manifest = orchestrator.manifest(&server).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Commands::Call { server, tool, args } => {
            let args: Map<String, Value> =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            let payload = transport.call_tool(&server, &tool, args).await?;
            println!("{}", serde_json::to_string_pretty(&payload.to_value())?);
        }
        Commands::Worker { .. } | Commands::Config | Commands::Completions { .. } => {}
    }
    Ok(())
}

fn print_report(orchestrator: &Orchestrator, run_id: &str) -> anyhow::Result<()> {
    let report = orchestrator.report(run_id)?;
    println!("Run:       {}", report.run_id);
    println!("Plan:      {}", report.plan_id);
    println!("Status:    {}", report.status);
    println!(
        "Nodes:     {}/{} succeeded, {} ms total",
        report.success_count, report.node_count, report.total_duration_ms
    );
    if let Some(error) = &report.error {
        println!("Error:     {error}");
    }
    if !report.artifacts.is_empty() {
        println!("Artifacts:");
        for uri in &report.artifacts {
            println!("  {uri}");
        }
    }
    if report.status == Status::Success {
        if let Some(result) = &report.result {
            println!("Result:");
            println!("{}", serde_json::to_string_pretty(result)?);
        }
    }
    Ok(())
}
