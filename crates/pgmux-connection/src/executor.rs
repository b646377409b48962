//! Executors backed by a [`ConnectionPool`]

use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use pgmux_core::{
    Connection, Executor, PgmuxError, QueryResult, Result, Value, convert_array_params,
};
use tokio::sync::Mutex;

use crate::pool::{ConnectionPool, PooledConnection};

/// Parameters as the connection should receive them
fn bind_params<'a>(conn: &dyn Connection, params: &'a [Value]) -> Cow<'a, [Value]> {
    if conn.supports_native_arrays() || !params.iter().any(Value::is_array) {
        return Cow::Borrowed(params);
    }
    Cow::Owned(convert_array_params(Some(params)).unwrap_or_default())
}

/// Shared executor: every statement borrows a connection for its duration
pub struct PoolExecutor {
    pool: ConnectionPool,
}

impl PoolExecutor {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl Executor for PoolExecutor {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let conn = self.pool.get().await?;
        let params = bind_params(&*conn, params);
        conn.execute(sql, &params).await
    }

    async fn reserve(&self) -> Result<Arc<dyn Executor>> {
        let conn = self.pool.get().await?;
        tracing::trace!(driver = conn.driver_name(), "reserved connection");
        Ok(Arc::new(ReservedExecutor::new(self.pool.clone(), conn)))
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }

    fn raw(&self) -> &dyn Any {
        &self.pool
    }
}

/// Executor pinned to one physical connection until released
///
/// Releasing (or dropping) the executor hands the connection back to the
/// pool. Statements issued after release fail with `ReservationReleased`.
pub struct ReservedExecutor {
    pool: ConnectionPool,
    connection: Mutex<Option<PooledConnection>>,
}

impl ReservedExecutor {
    fn new(pool: ConnectionPool, connection: PooledConnection) -> Self {
        Self {
            pool,
            connection: Mutex::new(Some(connection)),
        }
    }

    /// Whether the connection has been handed back
    pub async fn is_released(&self) -> bool {
        self.connection.lock().await.is_none()
    }
}

#[async_trait]
impl Executor for ReservedExecutor {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let guard = self.connection.lock().await;
        let conn = guard.as_ref().ok_or(PgmuxError::ReservationReleased)?;
        let params = bind_params(&**conn, params);
        conn.execute(sql, &params).await
    }

    async fn reserve(&self) -> Result<Arc<dyn Executor>> {
        let conn = self.pool.get().await?;
        Ok(Arc::new(ReservedExecutor::new(self.pool.clone(), conn)))
    }

    async fn release(&self) -> Result<()> {
        let conn = self.connection.lock().await.take();
        if conn.is_some() {
            tracing::trace!("released reserved connection");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        match self.connection.try_lock() {
            Ok(guard) => guard.as_ref().is_none_or(|conn| conn.is_closed()),
            // Running a statement
            Err(_) => false,
        }
    }

    fn raw(&self) -> &dyn Any {
        &self.pool
    }
}
