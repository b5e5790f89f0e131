mod characters;
mod clock;
mod config;
mod game;
mod lobby;
mod matchmaker;
mod net;
mod server;
mod store;
mod world;

use crate::config::ServerConfig;
use crate::net::Outbound;
use crate::server::ServerCore;
use crate::store::CredentialStore;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
/// Activates tracing, loads the configuration, binds the TCP and UDP
/// endpoint on the same port and runs until ctrl-c. Exits 0 on graceful
/// shutdown, 1 on a bind failure or an invalid argument.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let mut config = match ServerConfig::load(Path::new("ServerConfig.json")) {
        Ok(config) => config,
        Err(message) => {
            tracing::error!(message, "Configuration error.");
            std::process::exit(1);
        }
    };

    // A single optional positional argument overrides the port.
    let mut args = std::env::args().skip(1);
    if let Some(raw) = args.next() {
        match raw.parse::<u16>() {
            Ok(port) => config.port = port,
            Err(_) => {
                eprintln!("usage: arena-server [port]");
                std::process::exit(1);
            }
        }
    }
    if args.next().is_some() {
        eprintln!("usage: arena-server [port]");
        std::process::exit(1);
    }

    let store = match CredentialStore::open(&config.database_path).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(%err, path = config.database_path, "Credential store failed to open.");
            std::process::exit(1);
        }
    };

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, addr = bind_addr, "TCP bind failed.");
            std::process::exit(1);
        }
    };
    let udp = match UdpSocket::bind(&bind_addr).await {
        Ok(udp) => Arc::new(udp),
        Err(err) => {
            tracing::error!(%err, addr = bind_addr, "UDP bind failed.");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = bind_addr, "Listening on TCP and UDP.");

    let config = Arc::new(config);
    let outbound = Arc::new(Outbound::new(udp.clone()));
    let core = ServerCore::new(config, store, outbound);
    core.start_background().await;

    let endpoint_core = core.clone();
    let endpoint = tokio::spawn(async move {
        net::run_endpoint(endpoint_core, listener, udp).await;
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Shutting down.");
        }
        Err(err) => {
            tracing::error!(?err, "Signal handler failed.");
        }
    }
    endpoint.abort();
}
