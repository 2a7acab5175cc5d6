//! The gateway as a cube handler.
//!
//! It listens on no bus channel. `on_start` parses the settings and starts
//! the HTTP server; `on_stop` shuts it down gracefully.

use crate::server::{build_router, serve};
use crate::settings::GatewaySettings;
use async_trait::async_trait;
use cube_node::{Channel, Handler, Message, Node, Request, Response};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningServer {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct GatewayHandler {
    server: Mutex<Option<RunningServer>>,
}

impl GatewayHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the HTTP server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|server| server.local_addr)
    }
}

#[async_trait]
impl Handler for GatewayHandler {
    fn input_channels(&self) -> Vec<Channel> {
        Vec::new()
    }

    async fn on_start(&self, node: Arc<dyn Node>) -> anyhow::Result<()> {
        info!("Starting http gateway...");

        let settings = match GatewaySettings::from_params(|key| node.param(key)) {
            Ok(settings) => settings,
            Err(e) => {
                node.log_error(&e.to_string()).await;
                return Err(e.into());
            }
        };

        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], settings.port))).await?;
        let local_addr = listener.local_addr()?;
        let router = build_router(Arc::clone(&node), settings);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let server_node = Arc::clone(&node);
        let task = tokio::spawn(async move {
            if let Err(e) = serve(listener, router, shutdown_rx).await {
                error!(error = %e, "HTTP server failed");
                server_node.log_fatal(&e.to_string()).await;
            }
        });

        *self.server.lock() = Some(RunningServer {
            local_addr,
            shutdown_tx,
            task,
        });

        info!(addr = %local_addr, "Start http listening");
        node.log_info(&format!("Start http listening on {local_addr}")).await;
        Ok(())
    }

    async fn on_stop(&self, node: &dyn Node) {
        let Some(server) = self.server.lock().take() else {
            return;
        };

        let _ = server.shutdown_tx.send(());
        if tokio::time::timeout(SERVER_STOP_TIMEOUT, server.task)
            .await
            .is_err()
        {
            warn!("HTTP server did not stop in time");
        }
        node.log_info("Stop http listening").await;
    }

    async fn on_message(&self, node: &dyn Node, channel: Channel, _message: Message) {
        warn!(channel = %channel, "Gateway received a bus message");
        node.log_error("bus messages are not handled by the gateway").await;
    }

    async fn on_request(
        &self,
        node: &dyn Node,
        channel: Channel,
        _request: Request,
    ) -> anyhow::Result<Response> {
        warn!(channel = %channel, "Gateway received a bus request");
        node.log_error("bus requests are not handled by the gateway").await;
        Ok(Response::error(
            "400",
            "NotImplemented",
            "bus requests are not handled by the gateway",
        ))
    }
}
