//! caravan container node
//!
//! Hosts agent instances and runs the mobility protocol. The node named in
//! `CARAVAN_MAIN_CONTAINER` additionally hosts the global agent directory
//! and coordinates identity transfers.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use caravan_node::{serve, AddressBook, Config, ContainerNode, TcpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting caravan container node");

    let config = Config::from_env()?;
    info!(
        node = %config.node_name,
        listen_addr = %config.listen_addr,
        main_container = %config.main_container,
        is_main = config.is_main(),
        "Configuration loaded"
    );

    let book = Arc::new(AddressBook::new(config.peers.clone()));
    let transport = Arc::new(TcpTransport::new(
        config.node_name.clone(),
        book,
        config.call_timeout(),
    ));
    let node = Arc::new(ContainerNode::new(&config, transport));

    let listener = TcpListener::bind(config.listen_addr).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(serve(listener, node, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);
    let _ = server.await;

    info!("Container node shutdown complete");
    Ok(())
}
