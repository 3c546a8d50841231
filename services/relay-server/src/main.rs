// relay-server: a thin deployable wrapper around the relay hub.
//
// Reads an optional TOML config (RELAY_CONFIG), mounts the hub router,
// and serves until SIGTERM/Ctrl-C, then drains the hub.

use relay_hub::Hub;
use relay_server::config;
use std::env;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "relay-server starting");

    let cfg = match env::var("RELAY_CONFIG") {
        Ok(path) => match config::load_config_from_path(Path::new(&path)) {
            Ok(cfg) => {
                info!(path = %path, "config loaded");
                cfg
            }
            Err(e) => {
                eprintln!("FATAL: failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        Err(_) => config::ServerConfig::default(),
    };

    let hub = Hub::new(cfg.hub);
    hub.run().await;
    let router = relay_hub::build_router(hub.clone());

    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .expect("failed to bind");
    info!(addr = %cfg.bind, "relay server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    hub.shutdown().await;
    info!("relay server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
