use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ufleet::cli::Args;
use ufleet::config::{load_settings_file, ConfigStore};
use ufleet::deploy::{spawn_reconciler, HttpClusterApi, HttpContainerEngine, ENGINE_PORT};
use ufleet::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    // Load settings for provider mapping resolution
    let config = match &args.settings_file {
        Some(path) => match load_settings_file(path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("Failed to load settings file {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => Arc::new(ConfigStore::new()),
    };

    let engine = Arc::new(HttpContainerEngine::new(
        ENGINE_PORT,
        Duration::from_secs(30),
    ));
    let cluster_api = Arc::new(HttpClusterApi::new(Duration::from_secs(30)));

    let state = AppState::new(
        &args.fleet_id,
        &args.fleet_key,
        config,
        engine,
        cluster_api,
    );

    // Background poll finalizing in-flight deployments
    let _reconciler = spawn_reconciler(state.deployments.clone(), Duration::from_secs(10));

    let addr = format!("{}:{}", args.bind_addr, args.port);
    info!("Starting ufleet control plane on {}", addr);
    info!("Fleet id: {}", args.fleet_id);

    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
