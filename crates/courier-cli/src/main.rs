use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use courier_engine::{ConfigStore, Supervisor};
use courier_transport::MemoryConnector;
use courier_types::RelayConfig;

/// courier -- multi-account message relay daemon.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor until SIGINT/SIGTERM
    ///
    /// This binary wires the engine to the in-process loopback transport,
    /// which is what local smoke tests want. Service deployments embed the
    /// engine as a library and hand the supervisor a connector for the real
    /// remote service.
    Run {
        /// Path to the configuration file
        #[arg(long, default_value = "config.json")]
        config: PathBuf,

        /// Directory holding per-worker persisted state
        #[arg(long, default_value = ".courier")]
        state_dir: PathBuf,
    },

    /// Validate a configuration file and print a summary
    Check {
        /// Path to the configuration file
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
    },

    /// Print the configured workers and pairs
    Status {
        /// Path to the configuration file
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, state_dir } => run(config, state_dir).await,
        Commands::Check { config } => check(&config),
        Commands::Status { config } => status(&config),
    }
}

async fn run(config_path: PathBuf, state_dir: PathBuf) -> std::process::ExitCode {
    let store = match ConfigStore::open(config_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("error: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let connector = Arc::new(MemoryConnector::new());
    let supervisor = Supervisor::new(store, state_dir, connector);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        tracing::info!("termination signal received");
        let _ = shutdown_tx.send(true);
    });

    supervisor.run(shutdown_rx).await;
    std::process::ExitCode::SUCCESS
}

/// Resolve on SIGINT or (on unix) SIGTERM.
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn check(config_path: &PathBuf) -> std::process::ExitCode {
    match load_config(config_path) {
        Ok(config) => {
            let pair_count: usize = config.workers.iter().map(|w| w.pairs.len()).sum();
            println!(
                "ok: {} worker(s), {} pair(s), version {}",
                config.workers.len(),
                pair_count,
                config.version
            );
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn status(config_path: &PathBuf) -> std::process::ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    for worker in &config.workers {
        let state = if worker.enabled { "enabled" } else { "disabled" };
        println!("worker {} ({state}, session {})", worker.id, worker.session);
        for pair in &worker.pairs {
            let pair_state = if pair.enabled { "on" } else { "off" };
            println!(
                "  {} -> {} [{pair_state}, backfill {}]",
                pair.source, pair.target, pair.backfill_count
            );
        }
    }
    std::process::ExitCode::SUCCESS
}

fn load_config(path: &PathBuf) -> Result<RelayConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    RelayConfig::from_json(&content).map_err(|e| e.to_string())
}
