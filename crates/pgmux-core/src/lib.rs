//! pgmux core - shared abstractions for the connection manager
//!
//! This crate provides the traits and types every other pgmux crate
//! depends on:
//!
//! - `Connection` - one physical backend connection, implemented by drivers
//! - `Executor` - run / reserve / release capability the manager is built on
//! - `PhysicalPool` and `PoolConnector` - pool construction and teardown
//! - `PoolOptions` - pool configuration with layered overrides
//! - `convert_array_params` - array parameter literal encoding
//! - Common types like `Value`, `Row` and `QueryResult`

mod config;
mod connection;
mod encode;
mod error;
mod executor;
mod types;

pub use config::*;
pub use connection::*;
pub use encode::*;
pub use error::*;
pub use executor::*;
pub use types::*;
