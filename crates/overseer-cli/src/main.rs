//! The `overseer` operator binary.

use clap::{Parser, Subcommand};
use overseer_orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "overseer.toml";

#[derive(Parser)]
#[command(name = "overseer", about = "Overseer, the master orchestrator for worker agents")]
struct Cli {
    /// Path to config file [default: overseer.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until Ctrl-C
    Run {
        /// Seconds between status lines (0 disables them)
        #[arg(long, default_value_t = 30)]
        status_every: u64,
    },
    /// Discover running workers once and print the system status
    Status,
    /// List worker processes on this host without registering them
    Discover,
}

/// A missing default file means defaults; a missing explicit file is an error.
fn load_config(explicit: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let path = match explicit {
        Some(path) => path,
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if !default.exists() {
                return Ok(OrchestratorConfig::default());
            }
            default
        }
    };
    OrchestratorConfig::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {}", path.display(), e))
}

async fn log_events(orchestrator: Arc<Orchestrator>) {
    let mut events = orchestrator.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let kind = match &event {
                    OrchestratorEvent::TaskFinished(_) => "task_finished",
                    OrchestratorEvent::TaskReleased { .. } => "task_released",
                    _ => "state_change",
                };
                match serde_json::to_string(&event) {
                    Ok(json) => info!(kind, event = %json, "Orchestrator event"),
                    Err(e) => warn!(error = %e, "Unserializable event"),
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { status_every } => {
            let orchestrator = Arc::new(Orchestrator::new(config)?);
            let event_logger = tokio::spawn(log_events(orchestrator.clone()));
            orchestrator.start()?;
            info!(master_id = %orchestrator.master_id(), "Overseer running, Ctrl-C to stop");

            let period = Duration::from_secs(status_every.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    signal = tokio::signal::ctrl_c() => {
                        if let Err(e) = signal {
                            warn!(error = %e, "Failed to listen for Ctrl-C");
                        }
                        break;
                    }
                    _ = ticker.tick(), if status_every > 0 => {
                        let status = orchestrator.get_system_status();
                        println!("{}", serde_json::to_string(&status)?);
                    }
                }
            }

            orchestrator.stop().await;
            event_logger.abort();
            println!(
                "{}",
                serde_json::to_string_pretty(&orchestrator.get_system_status())?
            );
        }
        Commands::Status => {
            let orchestrator = Orchestrator::new(config)?;
            let report = orchestrator.discover().await;
            if let Some(error) = &report.error {
                warn!(error = %error, "Discovery incomplete");
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&orchestrator.get_system_status())?
            );
        }
        Commands::Discover => {
            let orchestrator = Orchestrator::new(config)?;
            let workers = orchestrator.scan_workers().await?;
            if workers.is_empty() {
                println!("No worker processes found.");
                println!("Workers are matched by discovery.worker_pattern in {DEFAULT_CONFIG}");
            } else {
                println!("Worker processes:");
                for worker in &workers {
                    let capabilities: Vec<&str> =
                        worker.capabilities.iter().map(String::as_str).collect();
                    println!(
                        "  {} (pid {}, {}) [{}]",
                        worker.agent_id,
                        worker.process.pid,
                        worker.role,
                        capabilities.join(", ")
                    );
                }
                println!("\nTotal: {} worker(s)", workers.len());
            }
        }
    }

    Ok(())
}
