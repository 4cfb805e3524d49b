use std::net::SocketAddr;
use std::sync::Arc;
use switchboard_hub::config::load_config;
use switchboard_hub::logging::{init_logging, install_panic_hook};
use switchboard_hub::{serve, Hub};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    install_panic_hook();

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() && !config.allow_remote {
        error!(
            event = "invalid_addr",
            addr = %config.addr,
            error = "non-loopback bind requires --allow-remote"
        );
        return;
    }

    let hub = Arc::new(Hub::from_config(config.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = hub.spawn_background(shutdown_rx);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        geocode = hub.enricher.is_enabled(),
        allow_remote = config.allow_remote
    );

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
        let _ = shutdown_tx.send(true);
    };

    if let Err(err) = serve(listener, hub, shutdown).await {
        error!(event = "hub_error", error = %err);
    }
    for task in background {
        let _ = task.await;
    }
}
