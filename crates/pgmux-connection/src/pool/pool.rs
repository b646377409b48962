//! Connection pool implementation

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use pgmux_core::{Connection, Executor, PgmuxError, PhysicalPool, PoolStats, Result};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use super::config::PoolConfig;
use crate::executor::PoolExecutor;

/// Factory trait for creating new connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Create a new connection
    async fn create(&self) -> Result<Arc<dyn Connection>>;

    /// Validate that a connection is still usable
    ///
    /// Default implementation checks that the connection is not closed.
    async fn validate(&self, conn: &dyn Connection) -> bool {
        !conn.is_closed()
    }
}

#[async_trait]
impl<T: ConnectionFactory> ConnectionFactory for Arc<T> {
    async fn create(&self) -> Result<Arc<dyn Connection>> {
        (**self).create().await
    }

    async fn validate(&self, conn: &dyn Connection) -> bool {
        (**self).validate(conn).await
    }
}

/// Internal wrapper for pooled connections with metadata
struct PooledConnectionInner {
    connection: Arc<dyn Connection>,
    created_at: Instant,
    last_used_at: Instant,
}

impl PooledConnectionInner {
    fn new(connection: Arc<dyn Connection>, created_at: Instant) -> Self {
        Self {
            connection,
            created_at,
            last_used_at: Instant::now(),
        }
    }
}

struct PoolInner {
    /// Pool configuration
    config: PoolConfig,
    /// Connection factory
    factory: Arc<dyn ConnectionFactory>,
    /// Available idle connections
    idle: Mutex<VecDeque<PooledConnectionInner>>,
    /// Semaphore to limit total connections; closed when the pool drains
    semaphore: Arc<Semaphore>,
    /// Number of active connections (borrowed from pool)
    active_count: AtomicUsize,
    /// Number of requests waiting for a connection
    waiting_count: AtomicUsize,
    /// Signalled every time a connection comes back
    returned: Notify,
    /// Set once draining has finished; late returns are closed, not kept
    closed: AtomicBool,
}

impl PoolInner {
    /// Return a connection to the pool
    fn return_connection(&self, connection: Arc<dyn Connection>, created_at: Instant) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);

        if self.closed.load(Ordering::SeqCst) {
            close_in_background(connection);
        } else if !connection.is_closed() {
            self.idle
                .lock()
                .push_back(PooledConnectionInner::new(connection, created_at));
        }

        self.returned.notify_waiters();
    }
}

fn close_in_background(connection: Arc<dyn Connection>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = connection.close().await {
                    tracing::warn!(error = %e, "failed to close connection returned after drain");
                }
            });
        }
        Err(_) => tracing::debug!("no runtime to close connection returned after drain"),
    }
}

/// A connection pool that manages a set of physical connections
///
/// The pool maintains a configurable number of connections and provides
/// them to callers on demand. Connections are automatically returned
/// to the pool when the `PooledConnection` wrapper is dropped. Cloning the
/// pool yields another handle to the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration and factory
    pub fn new<F: ConnectionFactory>(config: PoolConfig, factory: F) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size()));
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory: Arc::new(factory),
                idle: Mutex::new(VecDeque::new()),
                semaphore,
                active_count: AtomicUsize::new(0),
                waiting_count: AtomicUsize::new(0),
                returned: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get a connection from the pool
    ///
    /// This will:
    /// 1. Try to get an idle connection from the pool
    /// 2. If none available and under max_size, create a new connection
    /// 3. If at max_size, wait for a connection to be returned (with timeout)
    ///
    /// Returns `Timeout` if the acquire timeout is exceeded and
    /// `ConnectionEnded` once the pool has started draining.
    pub async fn get(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        inner.waiting_count.fetch_add(1, Ordering::SeqCst);

        let result = tokio::time::timeout(inner.config.acquire_timeout(), async {
            // Acquire a permit from the semaphore (limits total connections)
            let permit = inner
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PgmuxError::ConnectionEnded)?;

            let (connection, created_at) = match self.try_get_idle().await {
                Some(idle) => idle,
                None => (inner.factory.create().await?, Instant::now()),
            };

            inner.active_count.fetch_add(1, Ordering::SeqCst);

            Ok(PooledConnection {
                connection: Some(connection),
                created_at,
                pool: inner.clone(),
                _permit: permit,
            })
        })
        .await;

        inner.waiting_count.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(conn) => conn,
            Err(_) => Err(PgmuxError::Timeout(format!(
                "Timed out waiting for connection (timeout: {:?})",
                inner.config.acquire_timeout()
            ))),
        }
    }

    /// Try to get an idle connection, validating and checking lifetime
    async fn try_get_idle(&self) -> Option<(Arc<dyn Connection>, Instant)> {
        loop {
            let pooled = { self.inner.idle.lock().pop_front() };
            let pooled = pooled?;

            let expired = self
                .inner
                .config
                .max_lifetime()
                .is_some_and(|max| pooled.created_at.elapsed() > max);
            let stale = self
                .inner
                .config
                .idle_timeout()
                .is_some_and(|idle| pooled.last_used_at.elapsed() > idle);

            if expired || stale || !self.inner.factory.validate(&*pooled.connection).await {
                let _ = pooled.connection.close().await;
                continue;
            }

            return Some((pooled.connection, pooled.created_at));
        }
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock().len();
        let active = self.inner.active_count.load(Ordering::SeqCst);
        let waiting = self.inner.waiting_count.load(Ordering::SeqCst);
        PoolStats {
            total: idle + active,
            idle,
            active,
            waiting,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Whether the pool has stopped handing out connections
    pub fn is_draining(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    /// Close all idle connections in the pool
    pub async fn close_idle(&self) {
        let connections: Vec<_> = {
            let mut idle = self.inner.idle.lock();
            idle.drain(..).collect()
        };

        for inner in connections {
            let _ = inner.connection.close().await;
        }
    }

    /// Stop handing out connections and close the pool.
    ///
    /// Waits up to `timeout` for checked-out connections to be returned.
    /// Connections still checked out after that are abandoned and closed
    /// whenever their holders drop them.
    pub async fn drain(&self, timeout: Duration) {
        self.inner.semaphore.close();

        let inner = self.inner.clone();
        let all_returned = async move {
            loop {
                let notified = inner.returned.notified();
                if inner.active_count.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(timeout, all_returned).await.is_err() {
            tracing::warn!(
                active = self.inner.active_count.load(Ordering::SeqCst),
                timeout = ?timeout,
                "pool drain timed out with connections still checked out"
            );
        }

        self.inner.closed.store(true, Ordering::SeqCst);
        self.close_idle().await;
        tracing::debug!("pool drained");
    }

    /// Shared executor over this pool
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::new(PoolExecutor::new(self.clone()))
    }
}

#[async_trait]
impl PhysicalPool for ConnectionPool {
    fn executor(&self) -> Arc<dyn Executor> {
        ConnectionPool::executor(self)
    }

    async fn drain(&self, timeout: Duration) {
        ConnectionPool::drain(self, timeout).await
    }

    fn stats(&self) -> PoolStats {
        ConnectionPool::stats(self)
    }
}

/// A connection borrowed from the pool
///
/// When dropped, the connection is automatically returned to the pool.
pub struct PooledConnection {
    connection: Option<Arc<dyn Connection>>,
    created_at: Instant,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().expect("connection taken").as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.pool.return_connection(conn, self.created_at);
        }
    }
}

impl PooledConnection {
    /// Get the underlying connection as an Arc
    pub fn inner(&self) -> &Arc<dyn Connection> {
        self.connection.as_ref().expect("connection taken")
    }
}
