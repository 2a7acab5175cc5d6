//! # Cube
//!
//! The node itself: owns the pool, the dispatchers and the handler, and
//! drives them through the lifecycle.
//!
//! ## Startup
//!
//! 1. Open the connection pool (fatal if the bus is unreachable)
//! 2. Subscribe every input channel concurrently (fatal on any failure)
//! 3. Spawn one dispatcher task per subscription
//! 4. Call `Handler::on_start` (failure tears everything down)
//!
//! ## Shutdown
//!
//! Triggered by SIGINT/SIGTERM or [`Node::stop`]. Dispatchers are stopped
//! and awaited, then `Handler::on_stop` runs, then the pool is drained. Each
//! step is bounded by the shutdown timeout; overruns are logged and skipped.

use crate::channel::Channel;
use crate::config::NodeConfig;
use crate::dispatcher::Dispatcher;
use crate::envelope::{Message, Request, Response};
use crate::error::{CubeError, CubeResult};
use crate::handler::{Handler, Node};
use crate::lifecycle::{termination_signal, LifecycleState};
use crate::logger::{LogEmitter, LogLevel};
use crate::pool::ConnectionPool;
use crate::rpc::RpcClient;
use async_trait::async_trait;
use cube_bus::BusConnector;
use futures::future::{join_all, try_join_all};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A running node.
pub struct Cube {
    class: String,
    instance_id: String,
    params: BTreeMap<String, String>,
    queue_group: Option<String>,
    shutdown_timeout: Duration,
    handler: Arc<dyn Handler>,
    rpc: RpcClient,
    logger: LogEmitter,
    state: RwLock<LifecycleState>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Cube {
    /// Build a node. Nothing touches the bus until [`Cube::start`].
    pub fn new(
        config: NodeConfig,
        handler: Arc<dyn Handler>,
        connector: Arc<dyn BusConnector>,
    ) -> CubeResult<Arc<Self>> {
        config.validate()?;
        let mapper = Arc::new(config.channel_mapper()?);
        let pool = ConnectionPool::new(connector, config.pool_size, config.borrow_timeout());
        let rpc = RpcClient::new(mapper, pool);

        let instance_id = config.resolve_instance_id();
        let logger = LogEmitter::new(rpc.clone(), config.class.clone(), instance_id.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            class: config.class.clone(),
            instance_id,
            queue_group: config.queue_group().map(str::to_string),
            shutdown_timeout: config.shutdown_timeout(),
            params: config.params,
            handler,
            rpc,
            logger,
            state: RwLock::new(LifecycleState::Constructed),
            started: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            dispatchers: Mutex::new(Vec::new()),
        }))
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Outbound client, shared with dispatchers.
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.write() = state;
    }

    /// Bring the node to `Running`.
    pub async fn start(self: &Arc<Self>) -> CubeResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CubeError::AlreadyStarted);
        }

        if let Err(e) = self.rpc.pool().open().await {
            error!(error = %e, "Cannot open connection pool");
            self.set_state(LifecycleState::Stopped);
            return Err(e);
        }
        self.set_state(LifecycleState::PoolOpen);

        let channels: BTreeSet<Channel> = self.handler.input_channels().into_iter().collect();
        let queue_group = self.queue_group.as_deref();
        let subscribed = try_join_all(
            channels
                .into_iter()
                .map(|channel| Dispatcher::subscribe(&self.rpc, channel, queue_group)),
        )
        .await;

        let dispatchers = match subscribed {
            Ok(dispatchers) => dispatchers,
            Err(e) => {
                error!(error = %e, "Cannot subscribe input channels");
                self.rpc.pool().close().await;
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
        };

        let node: Arc<dyn Node> = Arc::clone(self) as Arc<dyn Node>;
        {
            let mut tasks = self.dispatchers.lock();
            for dispatcher in dispatchers {
                tasks.push(tokio::spawn(dispatcher.run(
                    Arc::clone(&self.handler),
                    Arc::clone(&node),
                    self.rpc.clone(),
                    self.shutdown_rx.clone(),
                )));
            }
            info!(count = tasks.len(), "Dispatchers running");
        }
        self.set_state(LifecycleState::DispatchersRunning);

        if let Err(e) = self.handler.on_start(node).await {
            error!(error = %e, "Handler start failed");
            self.teardown().await;
            return Err(CubeError::HandlerStart(format!("{e:#}")));
        }
        self.set_state(LifecycleState::HandlerStarted);

        info!(
            class = %self.class,
            instance = %self.instance_id,
            "Cube started"
        );
        self.set_state(LifecycleState::Running);
        Ok(())
    }

    /// Block until a termination signal or [`Node::stop`].
    pub async fn wait_for_shutdown(&self) {
        let mut stopped = self.shutdown_rx.clone();
        tokio::select! {
            _ = termination_signal() => info!("Termination signal received"),
            _ = async { stopped.wait_for(|stop| *stop).await.map(|_| ()) } => {
                info!("Stop requested");
            }
        }
    }

    /// Stop dispatchers, run the handler's stop callback, drain the pool.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return;
            }
            *state = LifecycleState::ShuttingDown;
        }
        info!("Initiating graceful shutdown...");

        self.stop_dispatchers().await;

        if tokio::time::timeout(self.shutdown_timeout, self.handler.on_stop(self))
            .await
            .is_err()
        {
            warn!("Handler stop callback exceeded shutdown timeout");
        }

        if tokio::time::timeout(self.shutdown_timeout, self.rpc.pool().close())
            .await
            .is_err()
        {
            warn!("Connection pool drain exceeded shutdown timeout");
        }

        self.set_state(LifecycleState::Stopped);
        info!("Shutdown complete");
    }

    /// Start, wait for a shutdown trigger, shut down.
    pub async fn run(self: &Arc<Self>) -> CubeResult<()> {
        self.start().await?;
        self.wait_for_shutdown().await;
        self.shutdown().await;
        Ok(())
    }

    async fn stop_dispatchers(&self) {
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.dispatchers.lock());
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(self.shutdown_timeout, join_all(tasks))
            .await
            .is_err()
        {
            warn!("Dispatchers did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    async fn teardown(&self) {
        self.set_state(LifecycleState::ShuttingDown);
        self.stop_dispatchers().await;
        self.rpc.pool().close().await;
        self.set_state(LifecycleState::Stopped);
    }
}

#[async_trait]
impl Node for Cube {
    fn param(&self, key: &str) -> Option<String> {
        self.params.get(key).cloned()
    }

    fn class(&self) -> &str {
        &self.class
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish(&self, channel: &Channel, message: Message) -> CubeResult<()> {
        self.rpc.publish(channel, &message).await
    }

    async fn call_method(
        &self,
        channel: &Channel,
        request: Request,
        timeout: Duration,
    ) -> CubeResult<Response> {
        self.rpc.call_method(channel, &request, timeout).await
    }

    async fn log(&self, level: LogLevel, text: &str) {
        self.logger.log(level, text).await;
    }

    fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Stop requested by handler");
        }
    }
}
