//! # Connection Pool
//!
//! Bounded pool of bus connections with a lending discipline:
//!
//! 1. `borrow()` waits for one of `size` leases (bounded by the borrow
//!    timeout), then hands out an idle connection or opens a new one.
//! 2. The returned [`PooledConnection`] is used for exactly one operation.
//! 3. Dropping the guard returns the connection, on every exit path.
//!
//! Connections are opened lazily; `open()` establishes the first one so an
//! unreachable bus fails node startup instead of the first request.

use crate::error::{CubeError, CubeResult};
use cube_bus::{BusConnection, BusConnector};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Default wait for a free lease.
pub const DEFAULT_BORROW_TIMEOUT: Duration = Duration::from_secs(5);

struct PoolInner {
    connector: Arc<dyn BusConnector>,
    size: usize,
    borrow_timeout: Duration,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Arc<dyn BusConnection>>>,
    closed: AtomicBool,
}

impl PoolInner {
    fn take_idle(&self) -> Option<Arc<dyn BusConnection>> {
        let mut idle = self.idle.lock();
        while let Some(connection) = idle.pop() {
            if !connection.is_closed() {
                return Some(connection);
            }
            debug!("Discarding closed pooled connection");
        }
        None
    }

    async fn connect(&self) -> CubeResult<Arc<dyn BusConnection>> {
        self.connector.connect().await.map_err(|e| {
            warn!(address = %self.connector.address(), error = %e, "Bus connection failed");
            CubeError::TransportUnavailable(e.to_string())
        })
    }
}

/// Bounded, shareable pool of bus connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool of `size` connections. Nothing is opened yet.
    pub fn new(connector: Arc<dyn BusConnector>, size: usize, borrow_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                size,
                borrow_timeout,
                permits: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(Vec::with_capacity(size)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Establish the first connection, failing fast if the bus is unreachable.
    pub async fn open(&self) -> CubeResult<()> {
        if self.is_closed() {
            return Err(CubeError::PoolClosed);
        }
        if self.inner.idle.lock().iter().any(|c| !c.is_closed()) {
            return Ok(());
        }

        let connection = self.inner.connect().await?;
        self.inner.idle.lock().push(connection);
        info!(
            address = %self.inner.connector.address(),
            size = self.inner.size,
            "Connection pool opened"
        );
        Ok(())
    }

    /// Lease a connection for one operation.
    pub async fn borrow(&self) -> CubeResult<PooledConnection> {
        if self.is_closed() {
            return Err(CubeError::PoolClosed);
        }

        let permits = Arc::clone(&self.inner.permits);
        let permit =
            match tokio::time::timeout(self.inner.borrow_timeout, permits.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(CubeError::PoolClosed),
                Err(_) => {
                    warn!(
                        size = self.inner.size,
                        waited_ms = self.inner.borrow_timeout.as_millis() as u64,
                        "Connection pool exhausted"
                    );
                    return Err(CubeError::PoolExhausted(self.inner.borrow_timeout));
                }
            };

        // the permit is released on every early return below
        let connection = match self.inner.take_idle() {
            Some(connection) => connection,
            None => self.inner.connect().await?,
        };

        Ok(PooledConnection {
            connection: Some(connection),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Drain the pool. Idle connections are closed now; leased ones are
    /// closed when their guard drops.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();

        let idle: Vec<_> = std::mem::take(&mut *self.inner.idle.lock());
        let count = idle.len();
        for connection in idle {
            connection.close().await;
        }
        info!(closed_connections = count, "Connection pool drained");
    }

    /// Leases currently available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Fixed pool size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Open connections waiting in the pool.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.connector.address())
            .field("size", &self.inner.size)
            .field("available", &self.available())
            .finish()
    }
}

/// A leased connection. Returned to the pool when dropped.
pub struct PooledConnection {
    connection: Option<Arc<dyn BusConnection>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn BusConnection;

    fn deref(&self) -> &Self::Target {
        // only None after drop has started
        match &self.connection {
            Some(connection) => connection.as_ref(),
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        if self.pool.closed.load(Ordering::SeqCst) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { connection.close().await });
            }
            return;
        }
        if connection.is_closed() {
            debug!("Dropping closed connection instead of returning it");
            return;
        }
        self.pool.idle.lock().push(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_bus::InMemoryBus;

    fn pool(bus: &InMemoryBus, size: usize) -> ConnectionPool {
        ConnectionPool::new(Arc::new(bus.clone()), size, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_open_establishes_first_connection() {
        let bus = InMemoryBus::new();
        let pool = pool(&bus, 3);

        pool.open().await.unwrap();
        assert_eq!(bus.connections_opened(), 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn test_open_fails_when_unreachable() {
        let bus = InMemoryBus::new();
        bus.set_reachable(false);
        let pool = pool(&bus, 3);

        assert!(matches!(
            pool.open().await,
            Err(CubeError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let bus = InMemoryBus::new();
        let pool = pool(&bus, 2);
        pool.open().await.unwrap();

        for _ in 0..5 {
            let lease = pool.borrow().await.unwrap();
            assert!(!lease.is_closed());
        }
        assert_eq!(bus.connections_opened(), 1);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_lease_released_on_drop() {
        let bus = InMemoryBus::new();
        let pool = pool(&bus, 2);

        let first = pool.borrow().await.unwrap();
        let second = pool.borrow().await.unwrap();
        assert_eq!(pool.available(), 0);

        drop(first);
        assert_eq!(pool.available(), 1);
        drop(second);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_times_out() {
        let bus = InMemoryBus::new();
        let pool = pool(&bus, 1);

        let _held = pool.borrow().await.unwrap();
        let result = pool.borrow().await;
        assert!(matches!(result, Err(CubeError::PoolExhausted(_))));
    }

    #[tokio::test]
    async fn test_waiting_borrow_gets_released_connection() {
        let bus = InMemoryBus::new();
        let pool = ConnectionPool::new(Arc::new(bus.clone()), 1, Duration::from_secs(5));

        let held = pool.borrow().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        drop(held);

        waiter.await.unwrap().unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_releases_lease() {
        let bus = InMemoryBus::new();
        bus.set_reachable(false);
        let pool = pool(&bus, 2);

        assert!(matches!(
            pool.borrow().await,
            Err(CubeError::TransportUnavailable(_))
        ));
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_borrow() {
        let bus = InMemoryBus::new();
        let pool = pool(&bus, 2);
        pool.open().await.unwrap();

        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.borrow().await, Err(CubeError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_closed_connections_are_not_reused() {
        let bus = InMemoryBus::new();
        let pool = pool(&bus, 1);

        {
            let lease = pool.borrow().await.unwrap();
            lease.close().await;
        }
        assert_eq!(pool.idle_count(), 0);

        let lease = pool.borrow().await.unwrap();
        assert!(!lease.is_closed());
        assert_eq!(bus.connections_opened(), 2);
    }
}
