//! Briggie Gateway - Main entry point.

use anyhow::Result;
use briggie_common::config::Config;
use briggie_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    // Load configuration; `.env` entries and then environment variables win over the file
    let config = Config::load_with_env()?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Briggie Gateway v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    tracing::info!(
        provider = %config.provider.label(),
        duration_ms = startup_start.elapsed().as_millis() as u64,
        "Configuration validated"
    );

    briggie_gateway::start_server(&config).await
}
