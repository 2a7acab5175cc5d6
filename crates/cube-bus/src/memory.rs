//! # In-Memory Bus
//!
//! Single-process implementation of the bus. Subjects, wildcards, queue groups
//! and reply subjects behave like the networked bus, which makes it the
//! transport of choice for tests and for nodes embedded in one process.

use crate::connection::{BusConnection, BusConnector, BusSubscription, Delivery};
use crate::subject::{new_inbox, subject_matches, validate_subject};
use crate::BusError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Subscriber {
    id: u64,
    pattern: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<Delivery>,
}

type OwnedIds = Arc<Mutex<HashSet<u64>>>;

/// Per-connection state the bus keeps a weak handle on.
struct ConnState {
    closed: AtomicBool,
    /// Live subscriptions created through the connection, removed on close.
    owned: OwnedIds,
}

impl ConnState {
    /// Close and drop every owned subscription. False if already closed.
    fn shut(&self, bus: &BusState) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let owned: HashSet<u64> = std::mem::take(&mut *self.owned.lock());
        for id in owned {
            bus.remove_subscriber(id);
        }
        true
    }
}

struct BusState {
    subscribers: RwLock<Vec<Subscriber>>,
    connections: Mutex<Vec<Weak<ConnState>>>,
    next_id: AtomicU64,
    round_robin: AtomicUsize,
    reachable: AtomicBool,
    connections_opened: AtomicU64,
    messages_published: AtomicU64,
}

impl BusState {
    /// Register a subscriber. With an `owner`, the id is tracked there until
    /// the subscription goes away.
    fn add_subscriber(
        self: &Arc<Self>,
        pattern: &str,
        queue_group: Option<&str>,
        owner: Option<&OwnedIds>,
    ) -> BusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(owner) = owner {
            owner.lock().insert(id);
        }

        self.subscribers.write().push(Subscriber {
            id,
            pattern: pattern.to_string(),
            queue_group: queue_group.map(str::to_string),
            sender,
        });

        let state: Weak<BusState> = Arc::downgrade(self);
        let owner: Option<Weak<Mutex<HashSet<u64>>>> = owner.map(Arc::downgrade);
        let subscription = BusSubscription::new(
            pattern,
            queue_group.map(str::to_string),
            receiver,
            move || {
                if let Some(owner) = owner.and_then(|owner| owner.upgrade()) {
                    owner.lock().remove(&id);
                }
                if let Some(state) = state.upgrade() {
                    state.remove_subscriber(id);
                }
            },
        );

        debug!(subject = pattern, queue_group = ?queue_group, id, "In-memory subscription created");
        subscription
    }

    fn remove_subscriber(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    /// Route one message; returns how many subscribers received it.
    fn route(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> usize {
        self.messages_published.fetch_add(1, Ordering::Relaxed);

        let subscribers = self.subscribers.read();
        let mut groups: HashMap<&str, Vec<&Subscriber>> = HashMap::new();
        let mut delivered = 0;

        let delivery = Delivery {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        };

        for subscriber in subscribers
            .iter()
            .filter(|s| subject_matches(&s.pattern, subject))
        {
            match subscriber.queue_group.as_deref() {
                Some(group) => groups.entry(group).or_default().push(subscriber),
                None => {
                    if subscriber.sender.send(delivery.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }

        for members in groups.values() {
            let pick = self.round_robin.fetch_add(1, Ordering::Relaxed) % members.len();
            if members[pick].sender.send(delivery.clone()).is_ok() {
                delivered += 1;
            }
        }

        trace!(subject, receivers = delivered, "In-memory message routed");
        delivered
    }
}

/// In-process bus shared by every connection created from it.
///
/// Cloning is cheap; clones share the same subjects.
#[derive(Clone)]
pub struct InMemoryBus {
    state: Arc<BusState>,
}

impl InMemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BusState {
                subscribers: RwLock::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                round_robin: AtomicUsize::new(0),
                reachable: AtomicBool::new(true),
                connections_opened: AtomicU64::new(0),
                messages_published: AtomicU64::new(0),
            }),
        }
    }

    /// Make subsequent `connect` calls fail, simulating an unreachable endpoint.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of live subscriptions across all connections.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.read().len()
    }

    /// Number of subscriptions on a given subject or pattern.
    #[must_use]
    pub fn subscribers_on(&self, pattern: &str) -> usize {
        self.state
            .subscribers
            .read()
            .iter()
            .filter(|s| s.pattern == pattern)
            .count()
    }

    /// Total connections ever opened.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.state.connections_opened.load(Ordering::Relaxed)
    }

    /// Total messages published, replies included.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.state.messages_published.load(Ordering::Relaxed)
    }

    /// Close every open connection, as a server restart would. Their
    /// subscriptions end; new connections can still be opened. Returns how
    /// many connections were closed.
    pub fn drop_connections(&self) -> usize {
        let connections: Vec<Arc<ConnState>> = {
            let mut registry = self.state.connections.lock();
            let live = registry.iter().filter_map(Weak::upgrade).collect();
            registry.clear();
            live
        };
        let closed = connections
            .iter()
            .filter(|connection| connection.shut(&self.state))
            .count();
        debug!(closed, "In-memory connections dropped");
        closed
    }

    /// Open a connection directly, without going through the trait object.
    pub fn open(&self) -> Result<MemoryConnection, BusError> {
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(BusError::Connect {
                address: self.address(),
                reason: "bus unreachable".into(),
            });
        }
        self.state.connections_opened.fetch_add(1, Ordering::Relaxed);

        let conn = Arc::new(ConnState {
            closed: AtomicBool::new(false),
            owned: Arc::new(Mutex::new(HashSet::new())),
        });
        let mut registry = self.state.connections.lock();
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(Arc::downgrade(&conn));

        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
            conn,
        })
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusConnector for InMemoryBus {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BusError> {
        Ok(Arc::new(self.open()?))
    }

    fn address(&self) -> String {
        "memory://local".to_string()
    }
}

/// Connection to an [`InMemoryBus`].
pub struct MemoryConnection {
    state: Arc<BusState>,
    conn: Arc<ConnState>,
}

impl MemoryConnection {
    /// Number of live subscriptions created through this connection.
    #[must_use]
    pub fn owned_subscriptions(&self) -> usize {
        self.conn.owned.lock().len()
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.conn.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        validate_subject(subject)?;
        self.state.route(subject, reply, payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<BusSubscription, BusError> {
        self.ensure_open()?;
        validate_subject(subject)?;
        Ok(self
            .state
            .add_subscriber(subject, queue_group, Some(&self.conn.owned)))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Delivery, BusError> {
        self.ensure_open()?;
        validate_subject(subject)?;

        let inbox = new_inbox();
        let mut reply_subscription = self.state.add_subscriber(&inbox, None, None);
        self.state.route(subject, Some(&inbox), payload);

        match tokio::time::timeout(timeout, reply_subscription.next_delivery()).await {
            Ok(Some(delivery)) => Ok(delivery),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }

    async fn close(&self) {
        self.conn.shut(&self.state);
    }

    fn is_closed(&self) -> bool {
        self.conn.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn payload(text: &'static str) -> Bytes {
        Bytes::from_static(text.as_bytes())
    }

    #[tokio::test]
    async fn test_publish_reaches_all_broadcast_subscribers() {
        let bus = InMemoryBus::new();
        let conn = bus.open().unwrap();

        let mut sub1 = conn.subscribe("svc.ping", None).await.unwrap();
        let mut sub2 = conn.subscribe("svc.ping", None).await.unwrap();

        conn.publish("svc.ping", None, payload("hello")).await.unwrap();

        let d1 = sub1.next_delivery().await.unwrap();
        let d2 = sub2.next_delivery().await.unwrap();
        assert_eq!(d1.payload, payload("hello"));
        assert_eq!(d2.payload, payload("hello"));
        assert!(d1.reply.is_none());
    }

    #[tokio::test]
    async fn test_queue_group_delivers_to_one_member() {
        let bus = InMemoryBus::new();
        let conn = bus.open().unwrap();

        let mut a = conn.subscribe("svc.work", Some("workers")).await.unwrap();
        let mut b = conn.subscribe("svc.work", Some("workers")).await.unwrap();

        for _ in 0..4 {
            conn.publish("svc.work", None, payload("job")).await.unwrap();
        }

        let mut received = 0;
        while let Ok(Some(_)) = timeout(Duration::from_millis(20), a.next_delivery()).await {
            received += 1;
        }
        while let Ok(Some(_)) = timeout(Duration::from_millis(20), b.next_delivery()).await {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let bus = InMemoryBus::new();
        let conn = bus.open().unwrap();
        let mut logs = conn.subscribe("log.>", None).await.unwrap();

        conn.publish("log.info.gateway.g1", None, payload("{}"))
            .await
            .unwrap();

        let delivery = logs.next_delivery().await.unwrap();
        assert_eq!(delivery.subject, "log.info.gateway.g1");
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = InMemoryBus::new();
        let responder = bus.open().unwrap();
        let requester = bus.open().unwrap();

        let mut sub = responder.subscribe("svc.echo", None).await.unwrap();
        tokio::spawn(async move {
            let delivery = sub.next_delivery().await.unwrap();
            let reply = delivery.reply.unwrap();
            responder
                .publish(&reply, None, delivery.payload)
                .await
                .unwrap();
        });

        let reply = requester
            .request("svc.echo", payload("ping"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, payload("ping"));
        // inbox subscription is gone after the request
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_without_responder() {
        let bus = InMemoryBus::new();
        let conn = bus.open().unwrap();

        let result = conn
            .request("svc.silent", payload("ping"), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(BusError::Timeout)));
    }

    #[tokio::test]
    async fn test_unreachable_bus() {
        let bus = InMemoryBus::new();
        bus.set_reachable(false);
        assert!(matches!(bus.connect().await, Err(BusError::Connect { .. })));
        assert_eq!(bus.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_owned_subscriptions() {
        let bus = InMemoryBus::new();
        let conn = bus.open().unwrap();
        let mut sub = conn.subscribe("svc.ping", None).await.unwrap();
        assert_eq!(bus.subscribers_on("svc.ping"), 1);

        conn.close().await;
        assert!(conn.is_closed());
        assert!(sub.next_delivery().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
        assert!(matches!(
            conn.publish("svc.ping", None, payload("x")).await,
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let bus = InMemoryBus::new();
        let conn = bus.open().unwrap();
        {
            let _sub = conn.subscribe("svc.ping", None).await.unwrap();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_connections_ends_subscriptions() {
        let bus = InMemoryBus::new();
        let first = bus.open().unwrap();
        let second = bus.open().unwrap();
        let mut sub = first.subscribe("svc.ping", None).await.unwrap();
        let _other = second.subscribe("svc.pong", None).await.unwrap();

        assert_eq!(bus.drop_connections(), 2);
        assert!(first.is_closed());
        assert!(second.is_closed());
        assert!(sub.next_delivery().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);

        // the bus itself keeps working
        let fresh = bus.open().unwrap();
        let _sub = fresh.subscribe("svc.ping", None).await.unwrap();
        assert_eq!(bus.subscribers_on("svc.ping"), 1);
        assert_eq!(bus.drop_connections(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_connection_bookkeeping() {
        let bus = InMemoryBus::new();
        let conn = bus.open().unwrap();

        for _ in 0..100 {
            let sub = conn.subscribe("svc.ping", None).await.unwrap();
            sub.unsubscribe();
        }
        let _kept = conn.subscribe("svc.ping", None).await.unwrap();

        assert_eq!(conn.owned_subscriptions(), 1);
        assert_eq!(bus.subscriber_count(), 1);

        conn.close().await;
        assert_eq!(conn.owned_subscriptions(), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
