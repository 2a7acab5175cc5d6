//! # Handler and Node Contracts
//!
//! ```text
//!   substrate ──(Handler)──→ service code
//!   service code ──(Node)──→ substrate
//! ```
//!
//! A service implements [`Handler`]; the substrate hands it a [`Node`] so it
//! can publish, call other nodes and log without knowing the transport.

use crate::channel::Channel;
use crate::envelope::{Message, Request, Response};
use crate::error::CubeResult;
use crate::logger::LogLevel;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Service callbacks driven by the node lifecycle and dispatchers.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Logical channels this node listens on. Queried once, before any
    /// dispatcher starts.
    fn input_channels(&self) -> Vec<Channel>;

    /// Called after every dispatcher is subscribed. An error aborts startup.
    async fn on_start(&self, node: Arc<dyn Node>) -> anyhow::Result<()>;

    /// Called once during shutdown, after dispatchers stopped.
    async fn on_stop(&self, node: &dyn Node);

    /// A delivery without a reply address.
    async fn on_message(&self, node: &dyn Node, channel: Channel, message: Message);

    /// A delivery that expects a reply. An error is answered with an
    /// internal-error response.
    async fn on_request(
        &self,
        node: &dyn Node,
        channel: Channel,
        request: Request,
    ) -> anyhow::Result<Response>;
}

/// Capabilities the substrate exposes to a handler.
#[async_trait]
pub trait Node: Send + Sync {
    /// Startup parameter by key.
    fn param(&self, key: &str) -> Option<String>;

    fn class(&self) -> &str;

    fn instance_id(&self) -> &str;

    /// Fire-and-forget delivery on a logical channel.
    async fn publish(&self, channel: &Channel, message: Message) -> CubeResult<()>;

    /// Request on a logical channel, waiting at most `timeout` for the reply.
    async fn call_method(
        &self,
        channel: &Channel,
        request: Request,
        timeout: Duration,
    ) -> CubeResult<Response>;

    /// Best-effort structured log record. Never fails.
    async fn log(&self, level: LogLevel, text: &str);

    /// Ask the node to shut down. Returns immediately.
    fn stop(&self);

    async fn log_trace(&self, text: &str) {
        self.log(LogLevel::Trace, text).await;
    }

    async fn log_debug(&self, text: &str) {
        self.log(LogLevel::Debug, text).await;
    }

    async fn log_info(&self, text: &str) {
        self.log(LogLevel::Info, text).await;
    }

    async fn log_warning(&self, text: &str) {
        self.log(LogLevel::Warning, text).await;
    }

    async fn log_error(&self, text: &str) {
        self.log(LogLevel::Error, text).await;
    }

    async fn log_fatal(&self, text: &str) {
        self.log(LogLevel::Fatal, text).await;
    }
}
