//! PostgreSQL connection factory and pool connector

use std::sync::Arc;

use async_trait::async_trait;
use pgmux_connection::{ConnectionFactory, ConnectionPool, PoolConfig};
use pgmux_core::{Connection, PgmuxError, PhysicalPool, PoolConnector, PoolOptions, Result};
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::{Config, NoTls};

use crate::PostgresConnection;
use crate::error::map_error;
use crate::tls::make_tls;

/// Build the driver configuration for `url` with pool options applied
pub fn build_config(url: &str, options: &PoolOptions) -> Result<Config> {
    let mut config: Config = url
        .parse()
        .map_err(|e| PgmuxError::Configuration(format!("invalid connection string: {}", e)))?;

    if let Some(database) = &options.database {
        config.dbname(database);
    }
    config
        .application_name(&options.application_name)
        .connect_timeout(options.connect_timeout());
    Ok(config)
}

/// Opens physical PostgreSQL connections
pub struct PostgresFactory {
    config: Config,
    tls: Option<MakeTlsConnector>,
    prepare: bool,
}

impl PostgresFactory {
    pub fn new(url: &str, options: &PoolOptions) -> Result<Self> {
        let config = build_config(url, options)?;
        let tls = make_tls(config.get_ssl_mode())?;
        Ok(Self {
            config,
            tls,
            prepare: options.prepare,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[async_trait]
impl ConnectionFactory for PostgresFactory {
    #[tracing::instrument(skip(self), fields(database = ?self.config.get_dbname()))]
    async fn create(&self) -> Result<Arc<dyn Connection>> {
        let client = match &self.tls {
            Some(tls) => {
                let (client, connection) = self
                    .config
                    .connect(tls.clone())
                    .await
                    .map_err(map_error)?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::error!(error = %e, "PostgreSQL connection error");
                    }
                });
                client
            }
            None => {
                let (client, connection) = self.config.connect(NoTls).await.map_err(map_error)?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::error!(error = %e, "PostgreSQL connection error");
                    }
                });
                client
            }
        };

        tracing::debug!("PostgreSQL connection established");
        Ok(Arc::new(PostgresConnection::new(client, self.prepare)))
    }
}

/// Builds a [`ConnectionPool`] of PostgreSQL connections per connection string
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnector;

impl PostgresConnector {
    pub fn new() -> Self {
        Self
    }
}

impl PoolConnector for PostgresConnector {
    fn connect(&self, url: &str, options: &PoolOptions) -> Result<Arc<dyn PhysicalPool>> {
        let factory = PostgresFactory::new(url, options)?;
        let config = PoolConfig::from_options(options)?;
        tracing::debug!(
            max_size = config.max_size(),
            application_name = %options.application_name,
            "creating PostgreSQL pool"
        );
        Ok(Arc::new(ConnectionPool::new(config, factory)))
    }
}
