use std::sync::Arc;

use agvfleet::{
    api,
    config::AppConfig,
    db::{app_storage::FleetStorage, roster},
    state::AppState,
};
use log::{error, info};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(config.log_level.as_str()));

    let settings = &config.settings;
    info!("Starting fleet coordinator with config:");
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Database path: {}", config.database_root_path);
    info!("  Roster: {}", config.roster_path.as_deref().unwrap_or("<built-in>"));
    info!(
        "  Fleet: max {} vehicles, {} concurrent tasks",
        settings.fleet.max_agvs, settings.fleet.max_concurrent_tasks
    );
    info!(
        "  Simulation: enabled={} every {:?} x{}",
        settings.simulation.enabled, settings.simulation.tick_interval, settings.simulation.speed_multiplier
    );
    info!(
        "  Route advisor: enabled={} url={:?} timeout {:?}",
        settings.advisor.enabled, settings.advisor.url, settings.advisor.timeout
    );

    let storage = Arc::new(FleetStorage::open(&config.database_root_path)?);
    let seeded = roster::seed_if_empty(
        storage.as_ref(),
        config.roster_path.as_deref(),
        settings.agv.charging_threshold,
    )?;
    if seeded > 0 {
        info!("Fresh store, {} vehicles registered from roster", seeded);
    }

    let simulation_enabled = settings.simulation.enabled;
    let bind_address = format!("{}:{}", config.host, config.port);
    let shared_state = Arc::new(AppState::new(storage, config));
    if simulation_enabled {
        shared_state.clock.start();
    }

    let app = api::router(shared_state.clone());

    let listener = TcpListener::bind(&bind_address).await?;
    info!("Server starting on http://{}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        })
        .await?;

    shared_state.clock.shutdown().await?;
    info!("Fleet state saved, bye");
    Ok(())
}
