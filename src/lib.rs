pub mod api;
pub mod config;
pub mod core_state;
pub mod db;
pub mod delivery;
pub mod intelligence;
pub mod models;
pub mod notification;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Core(#[from] core_state::CoreError),
    #[error("{0}")]
    Server(String),
    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

/// Start the service and block until Ctrl-C.
///
/// Order: tracing → configuration → state → background tasks → HTTP server.
/// Shutdown runs in reverse so no request can queue work after the worker
/// has stopped.
pub async fn run() -> Result<(), StartupError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("Redflag starting v{}", config::APP_VERSION);

    let config = config::AppConfig::load_with_dotenv()?;
    let bind_addr = config.server.bind_addr;
    let core = Arc::new(core_state::CoreState::open(config)?);

    if core.detector().is_degraded() {
        tracing::warn!(
            reason = core.detector().load_error().unwrap_or("unknown"),
            "Starting in degraded mode: no keyword corpus, no alerts will be raised"
        );
    }

    let tasks = delivery::start_background_tasks(core.clone());
    let server = match api::start_server(core, bind_addr).await {
        Ok(server) => server,
        Err(e) => {
            tasks.shutdown().await;
            return Err(StartupError::Server(e));
        }
    };
    tracing::info!(addr = %server.addr, "Redflag ready");

    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down");

    server.shutdown().await;
    tasks.shutdown().await;
    signal?;
    Ok(())
}
