mod config;

use clap::{Parser, Subcommand};
use config::{HubConfig, LogFormat};
use std::path::PathBuf;
use std::sync::Arc;
use switchyard_core::{CancellationToken, InMemoryJobQueue};
use switchyard_gateway::{AuthConfig, ConnectionRegistry, GatewayServer, StatusSource};
use switchyard_orchestrator::{CapabilityRouter, TaskOrchestrator};
use switchyard_resilience::{register_core_services, ResilienceMonitor};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchyard", about = "Switchyard orchestration hub")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "switchyard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hub
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Parse and validate the config file, then exit
    CheckConfig,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).pretty().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (config, found) = HubConfig::load(&cli.config).await?;
    init_tracing(config.logging.format);
    if !found {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }
    config.validate()?;

    match cli.command {
        Commands::CheckConfig => {
            println!("{}: ok", cli.config.display());
            Ok(())
        }
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            serve(config, host, port).await
        }
    }
}

async fn serve(config: HubConfig, host: String, port: u16) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let registry = ConnectionRegistry::new(config.registry);
    let router = CapabilityRouter::new(registry.clone(), config.router);
    let orchestrator = TaskOrchestrator::new(
        router.clone(),
        registry.clone(),
        Arc::new(InMemoryJobQueue::new()),
        config.orchestrator,
    );
    let monitor = ResilienceMonitor::new(registry.clone(), config.resilience);
    register_core_services(&monitor, &registry, &router, &orchestrator)?;

    router.attach();
    orchestrator.attach();
    monitor.attach();

    registry.start(shutdown.child_token());
    router.start(shutdown.child_token());
    orchestrator.start(shutdown.child_token());
    monitor.start(shutdown.child_token());
    info!("Hub components started");

    let status: Arc<dyn StatusSource> = monitor.clone();
    let app = GatewayServer::build_with_status(
        registry,
        Some(status),
        AuthConfig::new(config.server.api_keys),
    );

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Switchyard listening on {}", addr);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;

    shutdown.cancel();
    info!("Switchyard stopped");
    Ok(())
}
