//! Bounded physical connection pool
//!
//! This module provides the pool that backs every executor: configurable
//! sizing, acquire and idle timeouts, statistics, and bounded draining.
//!
//! # Example
//!
//! ```ignore
//! use pgmux_connection::pool::{ConnectionPool, PoolConfig};
//!
//! let config = PoolConfig::new(2, 10)
//!     .with_acquire_timeout_ms(5000)
//!     .with_idle_timeout_ms(300000);
//!
//! let pool = ConnectionPool::new(config, connection_factory);
//! let conn = pool.get().await?;
//! // Use connection...
//! // Connection returned to pool on drop
//! pool.drain(Duration::from_secs(1)).await;
//! ```

mod config;
mod pool;


pub use config::PoolConfig;
pub use pgmux_core::PoolStats;
pub use pool::{ConnectionFactory, ConnectionPool, PooledConnection};
