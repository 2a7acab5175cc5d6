//! # Cube HTTP Gateway binary
//!
//! ```text
//! cube-http-gateway --bus-host cubes-bus --bus-port 4444 --jwt-secret ... \
//!     --endpoints-map "/ping:svc.ping;/users:svc.users"
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cube_bus::NatsConnector;
use cube_http_gateway::{GatewayCli, GatewayHandler};
use cube_node::Cube;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = GatewayCli::parse();

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli.default_log_filter()))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    // Configuration errors surface before any bus connection
    let config = cli.node_config().context("can't start")?;
    info!(bus = %config.bus_address(), "Starting cube http gateway");

    let connector = NatsConnector::new(config.bus_host.clone(), config.bus_port)
        .with_client_name(config.class.clone());
    let cube = Cube::new(config, Arc::new(GatewayHandler::new()), Arc::new(connector))
        .context("can't start")?;

    cube.run().await.context("can't start instance")?;
    Ok(())
}
