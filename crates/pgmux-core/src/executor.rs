//! Executor capability and physical pool traits
//!
//! Everything above the driver is written against these traits only:
//! run a statement, reserve a dedicated connection, release it, and reach the
//! raw pool for advanced use.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{PoolOptions, QueryResult, Result, Value};

/// Capability to run statements against the backend
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a parameterized statement
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Check out an executor bound to one dedicated physical connection
    async fn reserve(&self) -> Result<Arc<dyn Executor>>;

    /// Give a reserved executor back to the pool it came from.
    ///
    /// Idempotent. A no-op for executors that are not reservations.
    async fn release(&self) -> Result<()>;

    /// Whether the executor can no longer run statements, for example
    /// because its physical connection was lost
    fn is_closed(&self) -> bool {
        false
    }

    /// Underlying pool handle, for callers that know the concrete driver
    fn raw(&self) -> &dyn Any;
}

/// Occupancy of a physical pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total number of connections (idle + active)
    pub total: usize,
    /// Number of idle connections available in the pool
    pub idle: usize,
    /// Number of connections currently checked out
    pub active: usize,
    /// Number of requests waiting for a connection
    pub waiting: usize,
}

impl PoolStats {
    /// Calculate pool utilization as a fraction (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.active as f64 / self.total as f64
        }
    }
}

/// A bounded set of physical connections
#[async_trait]
pub trait PhysicalPool: Send + Sync {
    /// Shared executor that borrows a connection per statement
    fn executor(&self) -> Arc<dyn Executor>;

    /// Stop accepting work, wait up to `timeout` for checked-out connections
    /// to come back, then close everything.
    async fn drain(&self, timeout: Duration);

    /// Current pool occupancy
    fn stats(&self) -> PoolStats;
}

/// Creates physical pools for a connection string
///
/// Pool creation must not perform I/O; connections are opened on demand.
pub trait PoolConnector: Send + Sync {
    /// Build a pool for `url` using fully merged options
    fn connect(&self, url: &str, options: &PoolOptions) -> Result<Arc<dyn PhysicalPool>>;
}
