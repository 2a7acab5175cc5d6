//! # Bus Connection
//!
//! The transport seam. A [`BusConnector`] opens connections; a
//! [`BusConnection`] carries publish, subscribe and request operations.
//! Implementations must be safe to share between tasks: the node pool hands a
//! connection to one operation at a time, but subscriptions created on a
//! connection keep receiving after the operation that created them returned.

use crate::BusError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::debug;

/// One message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Subject the message was published on.
    pub subject: String,
    /// Reply subject, present when the publisher expects an answer.
    pub reply: Option<String>,
    /// Raw payload.
    pub payload: Bytes,
}

/// Opens connections to a bus endpoint.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Establish a new connection.
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BusError>;

    /// Human readable endpoint, for logs.
    fn address(&self) -> String;
}

/// A live connection to the bus.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Publish `payload` on `subject`, optionally naming a reply subject.
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<(), BusError>;

    /// Subscribe to `subject`. With a queue group, each delivery goes to
    /// exactly one member of the group.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<BusSubscription, BusError>;

    /// Publish with an ephemeral reply subject and wait for the first reply.
    ///
    /// Returns [`BusError::Timeout`] when nothing arrives within `timeout`.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Delivery, BusError>;

    /// Close the connection. Subscriptions created on it end.
    async fn close(&self);

    /// True once the connection can no longer be used.
    fn is_closed(&self) -> bool;
}

type UnsubscribeFn = Box<dyn FnOnce() + Send + Sync>;

/// A subscription handle for receiving deliveries.
///
/// When dropped, the subscription is automatically removed from the bus.
pub struct BusSubscription {
    subject: String,
    queue_group: Option<String>,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    unsubscribe: Option<UnsubscribeFn>,
}

impl BusSubscription {
    /// Build a subscription from its delivery channel and an unsubscribe hook.
    pub fn new(
        subject: impl Into<String>,
        queue_group: Option<String>,
        receiver: mpsc::UnboundedReceiver<Delivery>,
        unsubscribe: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            queue_group,
            receiver,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Receive the next delivery.
    ///
    /// Returns `None` once the subscription or its connection is closed.
    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Subject (or pattern) this subscription listens on.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Queue group, when load-balanced.
    #[must_use]
    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Remove the subscription from the bus. Deliveries already buffered are
    /// discarded.
    pub fn unsubscribe(mut self) {
        self.run_unsubscribe();
    }

    fn run_unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
            debug!(subject = %self.subject, "Subscription removed");
        }
    }
}

impl fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSubscription")
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .finish()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.run_unsubscribe();
    }
}

impl Stream for BusSubscription {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
