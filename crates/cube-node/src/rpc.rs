//! # RPC Core
//!
//! Request/reply over plain pub/sub. Every operation holds one pooled
//! connection for exactly its own duration.

use crate::channel::{BusSubject, Channel, ChannelMapper};
use crate::envelope::{Message, Request, Response};
use crate::error::{CubeError, CubeResult};
use crate::pool::ConnectionPool;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Outbound side of a node: channel resolution plus pooled transport.
#[derive(Clone)]
pub struct RpcClient {
    mapper: Arc<ChannelMapper>,
    pool: ConnectionPool,
}

impl RpcClient {
    pub fn new(mapper: Arc<ChannelMapper>, pool: ConnectionPool) -> Self {
        Self { mapper, pool }
    }

    pub fn mapper(&self) -> &ChannelMapper {
        &self.mapper
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Fire-and-forget delivery of `message` on `channel`.
    pub async fn publish(&self, channel: &Channel, message: &Message) -> CubeResult<()> {
        let subject = self.mapper.to_physical(channel);
        let payload = serde_json::to_vec(message)?;
        self.publish_to_subject(&subject, Bytes::from(payload))
            .await
    }

    /// Raw publish on a physical subject, bypassing the mapper.
    pub async fn publish_to_subject(&self, subject: &BusSubject, payload: Bytes) -> CubeResult<()> {
        let connection = self.pool.borrow().await?;
        connection
            .publish(subject.as_str(), None, payload)
            .await
            .map_err(CubeError::from)?;
        trace!(subject = %subject, "Published");
        Ok(())
    }

    /// Send `request` on `channel` and wait up to `timeout` for the reply.
    ///
    /// The deadline covers the pool borrow as well as the round trip; either
    /// running out yields [`CubeError::Timeout`].
    pub async fn call_method(
        &self,
        channel: &Channel,
        request: &Request,
        timeout: Duration,
    ) -> CubeResult<Response> {
        let subject = self.mapper.to_physical(channel);
        let payload = Bytes::from(serde_json::to_vec(request)?);

        let exchange = async {
            let connection = self.pool.borrow().await?;
            connection
                .request(subject.as_str(), payload, timeout)
                .await
                .map_err(CubeError::from)
        };

        let delivery = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => return Err(CubeError::Timeout),
        };

        let response: Response = serde_json::from_slice(&delivery.payload)?;
        debug!(
            channel = %channel,
            subject = %subject,
            is_error = response.is_error(),
            "Reply received"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_bus::{BusConnection, InMemoryBus};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn client(bus: &InMemoryBus, mapping: &[(&str, &str)]) -> RpcClient {
        let table: BTreeMap<Channel, BusSubject> = mapping
            .iter()
            .map(|(c, s)| (Channel::from(*c), BusSubject::from(*s)))
            .collect();
        let mapper = ChannelMapper::new(table, true).unwrap();
        let pool = ConnectionPool::new(Arc::new(bus.clone()), 4, Duration::from_secs(1));
        RpcClient::new(Arc::new(mapper), pool)
    }

    #[tokio::test]
    async fn test_publish_uses_mapped_subject() {
        let bus = InMemoryBus::new();
        let observer = bus.open().unwrap();
        let mut sub = observer.subscribe("prod.events", None).await.unwrap();

        let client = client(&bus, &[("events", "prod.events")]);
        client
            .publish(&Channel::from("events"), &Message::new("created", json!({"id": 7})))
            .await
            .unwrap();

        let delivery = sub.next_delivery().await.unwrap();
        assert!(delivery.reply.is_none());
        let message: Message = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(message.method, "created");
        assert_eq!(client.pool().available(), 4);
    }

    #[tokio::test]
    async fn test_call_method_returns_reply_unmodified() {
        let bus = InMemoryBus::new();
        let responder = bus.open().unwrap();
        let mut sub = responder.subscribe("svc.echo", None).await.unwrap();

        let expected = Response::success(json!({"status": 200, "body": "pong"}));
        let reply = expected.clone();
        tokio::spawn(async move {
            let delivery = sub.next_delivery().await.unwrap();
            let payload = Bytes::from(serde_json::to_vec(&reply).unwrap());
            responder
                .publish(&delivery.reply.unwrap(), None, payload)
                .await
                .unwrap();
        });

        let client = client(&bus, &[]);
        let response = client
            .call_method(
                &Channel::from("svc.echo"),
                &Request::new("GET", json!("ping")),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response, expected);
        assert_eq!(client.pool().available(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_method_times_out_on_silence() {
        let bus = InMemoryBus::new();
        let silent = bus.open().unwrap();
        let _sub = silent.subscribe("svc.silent", None).await.unwrap();

        let client = client(&bus, &[]);
        let started = tokio::time::Instant::now();
        let result = client
            .call_method(
                &Channel::from("svc.silent"),
                &Request::new("GET", json!(null)),
                Duration::from_millis(50),
            )
            .await;

        assert!(matches!(result, Err(CubeError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(client.pool().available(), 4);
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_serialization_error() {
        let bus = InMemoryBus::new();
        let responder = bus.open().unwrap();
        let mut sub = responder.subscribe("svc.broken", None).await.unwrap();
        tokio::spawn(async move {
            let delivery = sub.next_delivery().await.unwrap();
            responder
                .publish(&delivery.reply.unwrap(), None, Bytes::from_static(b"not json"))
                .await
                .unwrap();
        });

        let client = client(&bus, &[]);
        let result = client
            .call_method(
                &Channel::from("svc.broken"),
                &Request::new("GET", json!(null)),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(CubeError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_unreachable_bus_is_transport_unavailable() {
        let bus = InMemoryBus::new();
        bus.set_reachable(false);
        let client = client(&bus, &[]);

        let result = client
            .publish(&Channel::from("anything"), &Message::new("m", json!(null)))
            .await;
        assert!(matches!(result, Err(CubeError::TransportUnavailable(_))));
        assert_eq!(client.pool().available(), 4);
    }
}
