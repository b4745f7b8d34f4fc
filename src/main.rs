use std::sync::Arc;

use tracing::{debug, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use coyote_relay::{
    ConfigManager, PulseService, RelayContext, RelayError, RelayRegistry, RelayServer, Scheduler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    let env_file_path = dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "coyote_relay=debug,warn".into()
            } else {
                "coyote_relay=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!(version = coyote_relay::VERSION, "Coyote relay starting");

    // Log environment loading after logger is initialized
    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let config_manager = ConfigManager::new().await?;
    let config = config_manager.get_config().await;

    let scripts = Arc::new(PulseService::load(&config.pulse.path).await?);

    let scheduler = Scheduler::new();
    scheduler.add_error_handler(|failure| {
        let err = RelayError::from(failure);
        warn!(code = %err.code(), error = %err, "Background task stopped");
        Ok(())
    });

    let ctx = RelayContext::new(scheduler.clone(), scripts, config_manager);
    let registry = RelayRegistry::new(ctx);
    registry.start_liveness_monitor().await;

    let mut server = RelayServer::new(config.server.clone(), Arc::clone(&registry));
    server.start().await?;

    info!("Relay started successfully");
    info!("Press Ctrl+C to stop the relay");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping relay...");

    server.stop().await?;
    registry.destroy_all().await;
    scheduler.stop().await;

    info!("Relay shutdown complete");
    Ok(())
}
