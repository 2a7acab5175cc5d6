//! # Inbound Dispatcher
//!
//! One dispatcher per input channel. Each owns a bus subscription and runs
//! in its own task, turning deliveries into handler callbacks:
//!
//! ```text
//! delivery ──┬─ reply address ──→ decode Request ──→ on_request ──→ publish Response
//!            └─ no reply ───────→ decode Message ──→ on_message
//! ```
//!
//! Deliveries of one channel are processed one at a time, in order. A request
//! always gets exactly one reply: handler errors and panics are answered with
//! an internal-error response. Deliveries that fail to decode are dropped.
//!
//! A subscription that ends while the node is running (its connection went
//! away) is re-established on a fresh pooled connection, retrying with
//! exponential backoff until it succeeds or shutdown fires.

use crate::channel::{BusSubject, Channel};
use crate::envelope::{Message, Request, Response};
use crate::error::{CubeError, CubeResult};
use crate::handler::{Handler, Node};
use crate::rpc::RpcClient;
use bytes::Bytes;
use cube_bus::{BusSubscription, Delivery};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(5);

pub(crate) struct Dispatcher {
    channel: Channel,
    subject: BusSubject,
    queue_group: Option<String>,
    subscription: BusSubscription,
}

async fn open_subscription(
    rpc: &RpcClient,
    subject: &BusSubject,
    queue_group: Option<&str>,
) -> CubeResult<BusSubscription> {
    let connection = rpc.pool().borrow().await?;
    connection
        .subscribe(subject.as_str(), queue_group)
        .await
        .map_err(|source| CubeError::Subscribe {
            subject: subject.to_string(),
            source,
        })
}

impl Dispatcher {
    /// Subscribe to the physical subject of `channel`.
    pub(crate) async fn subscribe(
        rpc: &RpcClient,
        channel: Channel,
        queue_group: Option<&str>,
    ) -> CubeResult<Self> {
        let subject = rpc.mapper().to_physical(&channel);
        let subscription = open_subscription(rpc, &subject, queue_group).await?;

        info!(
            channel = %channel,
            subject = %subject,
            queue_group = queue_group.unwrap_or("-"),
            "Dispatcher subscribed"
        );
        Ok(Self {
            channel,
            subject,
            queue_group: queue_group.map(str::to_string),
            subscription,
        })
    }

    /// Process deliveries until `shutdown` fires or the subscription ends.
    pub(crate) async fn run(
        mut self,
        handler: Arc<dyn Handler>,
        node: Arc<dyn Node>,
        rpc: RpcClient,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if *shutdown.borrow() {
            return;
        }

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                delivery = self.subscription.next_delivery() => delivery,
            };

            match delivery {
                Some(delivery) => {
                    handle_delivery(handler.as_ref(), node.as_ref(), &rpc, delivery).await;
                }
                None => {
                    warn!(
                        channel = %self.channel,
                        subject = %self.subject,
                        "Subscription ended, re-subscribing"
                    );
                    if !self.resubscribe(&rpc, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        debug!(channel = %self.channel, "Dispatcher stopped");
        self.subscription.unsubscribe();
    }

    /// Replace an ended subscription. False when shutdown fired or the pool
    /// was closed first.
    async fn resubscribe(&mut self, rpc: &RpcClient, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut backoff = RESUBSCRIBE_INITIAL_BACKOFF;
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return false;
            }
            attempt += 1;

            match open_subscription(rpc, &self.subject, self.queue_group.as_deref()).await {
                Ok(subscription) => {
                    self.subscription = subscription;
                    info!(
                        channel = %self.channel,
                        subject = %self.subject,
                        attempt,
                        "Dispatcher re-subscribed"
                    );
                    return true;
                }
                Err(CubeError::PoolClosed) => return false,
                Err(e) => warn!(
                    channel = %self.channel,
                    attempt,
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Re-subscribe failed"
                ),
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => return false,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
        }
    }
}

async fn handle_delivery(handler: &dyn Handler, node: &dyn Node, rpc: &RpcClient, delivery: Delivery) {
    let channel = rpc.mapper().to_logical(&BusSubject::new(delivery.subject.as_str()));

    match delivery.reply {
        Some(reply) => {
            let request: Request = match serde_json::from_slice(&delivery.payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(subject = %delivery.subject, error = %e, "Dropping undecodable request");
                    return;
                }
            };
            let response = dispatch_request(handler, node, channel, request).await;
            send_reply(rpc, &BusSubject::new(reply), &response).await;
        }
        None => {
            let message: Message = match serde_json::from_slice(&delivery.payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!(subject = %delivery.subject, error = %e, "Dropping undecodable message");
                    return;
                }
            };
            let outcome = AssertUnwindSafe(handler.on_message(node, channel.clone(), message))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                error!(channel = %channel, "Message handler panicked");
            }
        }
    }
}

async fn dispatch_request(
    handler: &dyn Handler,
    node: &dyn Node,
    channel: Channel,
    request: Request,
) -> Response {
    let method = request.method.clone();
    let outcome = AssertUnwindSafe(handler.on_request(node, channel.clone(), request))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(channel = %channel, method = %method, error = %e, "Request handler failed");
            Response::internal_error(e.to_string())
        }
        Err(_) => {
            error!(channel = %channel, method = %method, "Request handler panicked");
            Response::internal_error("request handler panicked")
        }
    }
}

async fn send_reply(rpc: &RpcClient, reply: &BusSubject, response: &Response) {
    let payload = match serde_json::to_vec(response)
        .or_else(|e| serde_json::to_vec(&Response::internal_error(e.to_string())))
    {
        Ok(payload) => payload,
        Err(e) => {
            error!(reply = %reply, error = %e, "Cannot encode reply");
            return;
        }
    };

    if let Err(e) = rpc.publish_to_subject(reply, Bytes::from(payload)).await {
        warn!(reply = %reply, error = %e, "Failed to publish reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelMapper;
    use crate::error::CubeResult;
    use crate::logger::LogLevel;
    use crate::pool::ConnectionPool;
    use async_trait::async_trait;
    use cube_bus::{BusConnection, InMemoryBus};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    struct StubNode;

    #[async_trait]
    impl Node for StubNode {
        fn param(&self, _key: &str) -> Option<String> {
            None
        }
        fn class(&self) -> &str {
            "stub"
        }
        fn instance_id(&self) -> &str {
            "stub-1"
        }
        async fn publish(&self, _channel: &Channel, _message: Message) -> CubeResult<()> {
            Ok(())
        }
        async fn call_method(
            &self,
            _channel: &Channel,
            _request: Request,
            _timeout: Duration,
        ) -> CubeResult<Response> {
            Err(CubeError::Timeout)
        }
        async fn log(&self, _level: LogLevel, _text: &str) {}
        fn stop(&self) {}
    }

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(Channel, Message)>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        fn input_channels(&self) -> Vec<Channel> {
            vec![Channel::from("jobs")]
        }
        async fn on_start(&self, _node: Arc<dyn Node>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn on_stop(&self, _node: &dyn Node) {}
        async fn on_message(&self, _node: &dyn Node, channel: Channel, message: Message) {
            self.messages.lock().push((channel, message));
        }
        async fn on_request(
            &self,
            _node: &dyn Node,
            _channel: Channel,
            request: Request,
        ) -> anyhow::Result<Response> {
            match request.method.as_str() {
                "fail" => anyhow::bail!("refused"),
                "panic" => panic!("handler bug"),
                _ => Ok(Response::success(request.params)),
            }
        }
    }

    fn rpc(bus: &InMemoryBus, mapping: &[(&str, &str)]) -> RpcClient {
        let table = mapping
            .iter()
            .map(|(c, s)| (Channel::from(*c), BusSubject::from(*s)))
            .collect();
        let pool = ConnectionPool::new(Arc::new(bus.clone()), 4, Duration::from_secs(1));
        RpcClient::new(Arc::new(ChannelMapper::new(table, true).unwrap()), pool)
    }

    async fn spawn_dispatcher(
        bus: &InMemoryBus,
        handler: Arc<Recorder>,
    ) -> (RpcClient, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let rpc = rpc(bus, &[("jobs", "prod.jobs")]);
        let dispatcher = Dispatcher::subscribe(&rpc, Channel::from("jobs"), None)
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(handler, Arc::new(StubNode), rpc.clone(), rx));
        (rpc, tx, task)
    }

    #[tokio::test]
    async fn test_request_reply_through_mapping() {
        let bus = InMemoryBus::new();
        let (rpc, tx, task) = spawn_dispatcher(&bus, Arc::new(Recorder::default())).await;

        let response = rpc
            .call_method(
                &Channel::from("jobs"),
                &Request::new("echo", json!({"n": 1})),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!({"n": 1})));

        tx.send_replace(true);
        task.await.unwrap();
        assert_eq!(bus.subscribers_on("prod.jobs"), 0);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_get_internal_error() {
        let bus = InMemoryBus::new();
        let (rpc, _tx, _task) = spawn_dispatcher(&bus, Arc::new(Recorder::default())).await;

        for method in ["fail", "panic"] {
            let response = rpc
                .call_method(
                    &Channel::from("jobs"),
                    &Request::new(method, json!(null)),
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
            let errors = response.errors.unwrap();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].code, "500");
            assert_eq!(errors[0].name, "InternalError");
        }

        // the dispatcher survived the panic
        let response = rpc
            .call_method(
                &Channel::from("jobs"),
                &Request::new("echo", json!("still here")),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!("still here")));
    }

    #[tokio::test]
    async fn test_message_resolved_to_logical_channel() {
        let bus = InMemoryBus::new();
        let handler = Arc::new(Recorder::default());
        let (rpc, tx, task) = spawn_dispatcher(&bus, Arc::clone(&handler)).await;

        rpc.publish(&Channel::from("jobs"), &Message::new("created", json!(1)))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while handler.messages.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        {
            let messages = handler.messages.lock();
            assert_eq!(messages[0].0, Channel::from("jobs"));
            assert_eq!(messages[0].1.method, "created");
        }
        // messages never get a reply, so nothing else is subscribed
        assert_eq!(bus.subscriber_count(), 1);

        tx.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_request_is_dropped() {
        let bus = InMemoryBus::new();
        let (_rpc, _tx, _task) = spawn_dispatcher(&bus, Arc::new(Recorder::default())).await;

        let caller = bus.open().unwrap();
        let result = caller
            .request("prod.jobs", Bytes::from_static(b"{broken"), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(cube_bus::BusError::Timeout)));
    }

    #[tokio::test]
    async fn test_resubscribes_after_connection_loss() {
        let bus = InMemoryBus::new();
        let (rpc, tx, task) = spawn_dispatcher(&bus, Arc::new(Recorder::default())).await;
        assert_eq!(bus.subscribers_on("prod.jobs"), 1);

        assert!(bus.drop_connections() >= 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while bus.subscribers_on("prod.jobs") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let response = rpc
            .call_method(
                &Channel::from("jobs"),
                &Request::new("echo", json!("again")),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!("again")));

        tx.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_retries_until_bus_returns() {
        let bus = InMemoryBus::new();
        let (_rpc, tx, task) = spawn_dispatcher(&bus, Arc::new(Recorder::default())).await;

        bus.set_reachable(false);
        bus.drop_connections();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(bus.subscribers_on("prod.jobs"), 0);
        assert!(!task.is_finished());

        bus.set_reachable(true);
        tokio::time::sleep(RESUBSCRIBE_MAX_BACKOFF * 2).await;
        assert_eq!(bus.subscribers_on("prod.jobs"), 1);

        tx.send_replace(true);
        task.await.unwrap();
        assert_eq!(bus.subscribers_on("prod.jobs"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_resubscribe() {
        let bus = InMemoryBus::new();
        let (_rpc, tx, task) = spawn_dispatcher(&bus, Arc::new(Recorder::default())).await;

        bus.set_reachable(false);
        bus.drop_connections();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_on_closed_pool_fails() {
        let bus = InMemoryBus::new();
        let rpc = rpc(&bus, &[]);
        rpc.pool().close().await;

        let result = Dispatcher::subscribe(&rpc, Channel::from("jobs"), None).await;
        assert!(matches!(result, Err(CubeError::PoolClosed)));
    }
}
