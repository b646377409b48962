//! PostgreSQL driver for pgmux
//!
//! Provides [`PostgresConnector`], which builds one bounded pool of
//! `tokio-postgres` connections per connection string for the pool
//! registry, and the [`PostgresConnection`] those pools hand out.

mod connection;
mod driver;
mod error;
mod tls;

pub use connection::PostgresConnection;
pub use driver::{PostgresConnector, PostgresFactory, build_config};
pub use tls::make_tls;
