mod api;
mod app;
mod common;
mod config;
mod hub;
mod publishers;
mod sources;

use crate::app::App;
use crate::config::{AppSettings, GatewayConfig};
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    log::info!("starting camgate v{}", env!("CARGO_PKG_VERSION"));

    let settings = AppSettings::new()?;
    let config = GatewayConfig::load(&settings.config_path)?;
    log::info!(
        "loaded {} stream(s) from {}",
        config.streams.len(),
        settings.config_path
    );

    let app = Arc::new(App::new(&config)?);
    app.serve_streams();

    let router = api::create_router(app.clone());
    let listener = tokio::net::TcpListener::bind(&settings.bind_address).await?;
    log::info!("signaling server listening on {}", settings.bind_address);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("stopping stream producers...");
    app.hub.shutdown();
    log::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("received Ctrl+C signal");
        },
        _ = terminate => {
            log::info!("received terminate signal");
        },
    }
}
