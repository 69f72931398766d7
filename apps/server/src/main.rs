#![warn(clippy::all, clippy::pedantic)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use clap::Parser;
use tracing::{info, warn};
use vigil_service::config::{self, Config};
use vigil_service::service::priority;
use vigil_service::shutdown::{self, ShutdownReason};
use vigil_service::VigilService;

mod error;
mod routes;

use error::AppError;

#[derive(Parser)]
#[command(name = "vigil-server", version, about = "HTTP front end for the vigil monitoring engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Override `server.bind`
    #[arg(long, env = "BIND")]
    bind: Option<String>,

    /// Override `server.port`
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Serve the API without starting the monitoring loop
    #[arg(long)]
    paused: bool,
}

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = config::resolve_config_path(cli.config)?;
    let config = Config::from_config(Some(&config_path))?;
    logger::init_with(&config.log);

    let bind = cli.bind.unwrap_or_else(|| config.server.bind.clone());
    let port = cli.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;

    let service = Arc::new(VigilService::open(config, Some(config_path)).await?);
    if !cli.paused {
        service.start().await?;
    }

    run_server(addr, service).await
}

async fn run_server(addr: SocketAddr, service: Arc<VigilService>) -> Result<(), AppError> {
    let state = web::Data::from(service.clone());
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(routes::routes))
        .disable_signals()
        .bind(addr)?
        .run();

    let coordinator = service.shutdown_coordinator().clone();
    let handle = server.handle();
    let task_timeout = service.config().shutdown.task_timeout();
    coordinator.register_task("stop-http-server", priority::HTTP_SERVER, task_timeout, false, move || async move {
        handle.stop(true).await;
        Ok(())
    });
    shutdown::install_signal_handlers(coordinator.clone());

    info!("Listening on http://{}", addr);
    let served = server.await;

    // The server also ends on its own if a worker dies
    let report = match service.shutdown(ShutdownReason::UserRequest).await {
        Some(report) => Some(report),
        None => coordinator.wait().await,
    };
    if let Some(report) = report {
        info!("Shutdown finished ({:?}) in {}ms", report.outcome(), report.duration_ms);
        if !report.failed.is_empty() {
            warn!("Failed shutdown tasks: {:?}", report.failed);
        }
    }

    served?;
    Ok(())
}
