//! Mock connections and executors shared by the unit tests

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pgmux_core::{
    Connection, Executor, PgmuxError, PhysicalPool, PoolConnector, PoolOptions, PoolStats,
    QueryResult, Result, Value,
};

use crate::pool::ConnectionFactory;

/// Mock connection that records every statement it runs
pub(crate) struct MockConnection {
    pub id: usize,
    closed: AtomicBool,
    /// Statement that makes this connection drop dead
    close_on: Option<String>,
    log: Arc<Mutex<Vec<(usize, String, Vec<Value>)>>>,
}

#[async_trait]
impl Connection for MockConnection {
    fn driver_name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        if self.is_closed() {
            return Err(PgmuxError::ConnectionClosed);
        }
        if self.close_on.as_deref() == Some(sql) {
            self.closed.store(true, Ordering::SeqCst);
            return Err(PgmuxError::ConnectionClosed);
        }
        self.log
            .lock()
            .push((self.id, sql.to_string(), params.to_vec()));
        Ok(QueryResult::affected(1))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Mock factory that counts connections created and closed
pub(crate) struct MockConnectionFactory {
    counter: AtomicUsize,
    created: Mutex<Vec<Arc<MockConnection>>>,
    close_first_on: Mutex<Option<String>>,
    log: Arc<Mutex<Vec<(usize, String, Vec<Value>)>>>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            close_first_on: Mutex::new(None),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of connections created so far
    pub fn count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Number of created connections that have been closed
    pub fn closed_count(&self) -> usize {
        self.created.lock().iter().filter(|c| c.is_closed()).count()
    }

    /// The first connection created dies when it is asked to run `sql`
    pub fn close_first_on(&self, sql: &str) {
        *self.close_first_on.lock() = Some(sql.to_string());
    }

    /// Mark connection `id` as lost
    pub fn kill(&self, id: usize) {
        self.created.lock()[id].closed.store(true, Ordering::SeqCst);
    }

    /// Statements run on connection `id`
    pub fn sql_on(&self, id: usize) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(conn, _, _)| *conn == id)
            .map(|(_, sql, _)| sql.clone())
            .collect()
    }

    /// Statements run so far as (connection id, sql, params)
    pub fn statements(&self) -> Vec<(usize, String, Vec<Value>)> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create(&self) -> Result<Arc<dyn Connection>> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let close_on = if id == 0 {
            self.close_first_on.lock().clone()
        } else {
            None
        };
        let conn = Arc::new(MockConnection {
            id,
            closed: AtomicBool::new(false),
            close_on,
            log: self.log.clone(),
        });
        self.created.lock().push(conn.clone());
        Ok(conn)
    }
}

/// Bookkeeping shared by a mock executor and all its reservations
#[derive(Default)]
pub(crate) struct MockBackend {
    next_id: AtomicUsize,
    reserved: AtomicUsize,
    released: AtomicUsize,
    fail_release: AtomicBool,
    failures: Mutex<HashMap<String, (String, String)>>,
    statements: Mutex<Vec<(Option<usize>, String)>>,
}

impl MockBackend {
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Reservations checked out and not yet released
    pub fn outstanding(&self) -> usize {
        self.reserved() - self.released()
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Make every execution of `sql` fail with a database error
    pub fn fail_statement(&self, sql: &str, code: &str) {
        self.failures
            .lock()
            .insert(sql.to_string(), (code.to_string(), format!("{} failed", sql)));
    }

    /// SQL text of every statement, in order
    pub fn sql(&self) -> Vec<String> {
        self.statements.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    /// Statements run on the shared (unreserved) executor
    pub fn shared_statements(&self) -> usize {
        self.statements
            .lock()
            .iter()
            .filter(|(id, _)| id.is_none())
            .count()
    }

    pub fn count(&self, sql: &str) -> usize {
        self.statements
            .lock()
            .iter()
            .filter(|(_, s)| s == sql)
            .count()
    }
}

/// Executor that talks to nothing and records what it is asked to do
pub(crate) struct MockExecutor {
    backend: Arc<MockBackend>,
    reservation: Option<usize>,
    released: AtomicBool,
}

impl MockExecutor {
    /// Shared executor plus the backend to inspect
    pub fn shared() -> (Arc<dyn Executor>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::default());
        let executor = Arc::new(Self {
            backend: backend.clone(),
            reservation: None,
            released: AtomicBool::new(false),
        });
        (executor, backend)
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<QueryResult> {
        if self.released.load(Ordering::SeqCst) {
            return Err(PgmuxError::ReservationReleased);
        }
        tokio::task::yield_now().await;
        self.backend
            .statements
            .lock()
            .push((self.reservation, sql.to_string()));
        if let Some((code, message)) = self.backend.failures.lock().get(sql) {
            return Err(PgmuxError::database(code.clone(), message.clone()));
        }
        Ok(QueryResult::empty())
    }

    async fn reserve(&self) -> Result<Arc<dyn Executor>> {
        tokio::task::yield_now().await;
        let id = self.backend.next_id.fetch_add(1, Ordering::SeqCst);
        self.backend.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Self {
            backend: self.backend.clone(),
            reservation: Some(id),
            released: AtomicBool::new(false),
        }))
    }

    async fn release(&self) -> Result<()> {
        if self.reservation.is_none() || self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.released.fetch_add(1, Ordering::SeqCst);
        if self.backend.fail_release.load(Ordering::SeqCst) {
            return Err(PgmuxError::Connection("release failed".into()));
        }
        Ok(())
    }

    fn raw(&self) -> &dyn Any {
        &self.backend
    }
}

/// Physical pool over a [`MockExecutor`] that records drains
pub(crate) struct MockPool {
    client: Arc<dyn Executor>,
    pub backend: Arc<MockBackend>,
    pub options: PoolOptions,
    drained: AtomicUsize,
}

impl MockPool {
    pub fn drained(&self) -> usize {
        self.drained.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PhysicalPool for MockPool {
    fn executor(&self) -> Arc<dyn Executor> {
        self.client.clone()
    }

    async fn drain(&self, _timeout: Duration) {
        tokio::task::yield_now().await;
        self.drained.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.backend.outstanding(),
            total: self.backend.outstanding(),
            ..Default::default()
        }
    }
}

/// Connector that hands out [`MockPool`]s and keeps them for inspection
#[derive(Default)]
pub(crate) struct MockConnector {
    pools: Mutex<Vec<(String, Arc<MockPool>)>>,
    fail: AtomicBool,
}

impl MockConnector {
    /// Number of physical pools created
    pub fn connects(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn pool(&self, index: usize) -> Arc<MockPool> {
        self.pools.lock()[index].1.clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl PoolConnector for MockConnector {
    fn connect(&self, url: &str, options: &PoolOptions) -> Result<Arc<dyn PhysicalPool>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PgmuxError::Connection(format!("cannot reach {}", url)));
        }
        let (client, backend) = MockExecutor::shared();
        let pool = Arc::new(MockPool {
            client,
            backend,
            options: options.clone(),
            drained: AtomicUsize::new(0),
        });
        self.pools.lock().push((url.to_string(), pool.clone()));
        Ok(pool)
    }
}
