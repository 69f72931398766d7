use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use vigil_service::config::{self, Config};
use vigil_service::shutdown::{self, ShutdownOutcome, ShutdownReason};
use vigil_service::VigilService;

#[derive(Parser)]
#[command(name = "vigil", version, about = "Network endpoint monitoring engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "VIGIL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Use this database file instead of `database.path`
    #[arg(long, env = "VIGIL_DATABASE", global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Monitor targets until interrupted (default)
    Run,
    /// Run a single monitoring cycle and print the result
    Once,
    /// Print the effective configuration
    Config,
    /// Probe one target outside the regular cycle
    Check {
        key: String,
        /// Ignore a cached result
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (mut config, config_path) = match load_config(cli.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("vigil: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    logger::init_with(&config.log);
    if let Some(database) = cli.database {
        config.database.enabled = true;
        config.database.path = database;
    }

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, config_path).await,
        Command::Once => once(config, config_path).await,
        Command::Config => {
            println!("{}", config_path.display());
            println!("{}", config);
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { key, force } => check(config, config_path, &key, force).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = config::resolve_config_path(path)?;
    let config = Config::from_config(Some(&path))
        .with_context(|| format!("cannot load configuration from {}", path.display()))?;
    Ok((config, path))
}

async fn run(config: Config, config_path: PathBuf) -> Result<ExitCode> {
    let service = Arc::new(VigilService::open(config, Some(config_path)).await?);
    let coordinator = service.shutdown_coordinator().clone();
    shutdown::install_signal_handlers(coordinator.clone());

    #[cfg(unix)]
    {
        let service = service.clone();
        coordinator.spawn_background("reload-on-hangup", async move {
            use tokio::signal::unix::{SignalKind, signal};

            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(hangup) => hangup,
                Err(e) => {
                    warn!("Cannot listen for SIGHUP: {}", e);
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                if let Err(e) = service.reload_configuration().await {
                    warn!("Reload failed: {:#}", e);
                }
            }
        });
    }

    service.start().await?;
    info!("vigil is monitoring, press Ctrl+C to stop");

    let Some(report) = coordinator.wait().await else {
        return Ok(ExitCode::FAILURE);
    };
    info!(
        "Shutdown finished ({:?}) in {}ms: {} completed, {} failed, {} skipped",
        report.outcome(),
        report.duration_ms,
        report.completed.len(),
        report.failed.len(),
        report.skipped.len()
    );

    Ok(match report.outcome() {
        ShutdownOutcome::Aborted => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

async fn once(config: Config, config_path: PathBuf) -> Result<ExitCode> {
    let service = VigilService::open(config, Some(config_path)).await?;
    let orchestrator = service.orchestrator();

    orchestrator.reload_targets().await;
    let summary = orchestrator.run_cycle_now().await?;
    let targets = orchestrator.snapshot().await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("{}", serde_json::to_string_pretty(&targets)?);

    service.shutdown(ShutdownReason::UserRequest).await;
    Ok(if summary.offline + summary.error == 0 { ExitCode::SUCCESS } else { ExitCode::from(2) })
}

async fn check(config: Config, config_path: PathBuf, key: &str, force: bool) -> Result<ExitCode> {
    let service = VigilService::open(config, Some(config_path)).await?;
    let orchestrator = service.orchestrator();

    orchestrator.reload_targets().await;
    let result = orchestrator.check_target(key, force).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    service.shutdown(ShutdownReason::UserRequest).await;
    Ok(if result.reachable { ExitCode::SUCCESS } else { ExitCode::from(2) })
}
