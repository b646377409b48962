//! pgmux connection layer
//!
//! This crate sits between callers and a physical pool: it runs work for
//! logical connection ids with transaction framing and bounded retry, keeps
//! warm reservations for long-lived ids, and shares one pool per connection
//! string through reference-counted leases.

mod context;
mod executor;
mod manager;
pub mod pool;
mod registry;
pub mod retry;
mod transaction;

#[cfg(test)]
mod testing;

pub use context::ConnectionInfo;
pub use executor::{PoolExecutor, ReservedExecutor};
pub use manager::ConnectionMgr;
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use registry::{ClientRef, PoolHandle, PoolRegistry};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use transaction::run_in_transaction;
