use anyhow::Context;
use control_plane::app::App;
use control_plane::config::ControlPlaneConfig;
use core_common::config::ConfigLoader;
use core_common::telemetry::init_tracing;
use core_common::SafeDisplay;
use std::path::Path;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config: ControlPlaneConfig = ConfigLoader::new(Path::new("control-plane.toml"))
        .load()
        .context("failed to load control-plane configuration")?;

    init_tracing(&config.tracing);
    info!(config = %config.to_safe_string(), "starting control plane");

    let mut app = App::new(config);
    app.start_background_tasks();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown signal received");
    app.shutdown();
    app.join_background().await;
    Ok(())
}
