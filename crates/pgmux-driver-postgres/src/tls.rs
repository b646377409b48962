//! TLS for connections whose connection string asks for it

use native_tls::TlsConnector;
use pgmux_core::{PgmuxError, Result};
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::config::SslMode;

/// TLS connector for `ssl_mode`, or `None` when TLS is disabled.
///
/// Like libpq's `prefer` and `require`, the server certificate is not
/// verified.
pub fn make_tls(ssl_mode: SslMode) -> Result<Option<MakeTlsConnector>> {
    if matches!(ssl_mode, SslMode::Disable) {
        return Ok(None);
    }

    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| PgmuxError::Configuration(format!("Failed to build TLS connector: {}", e)))?;

    Ok(Some(MakeTlsConnector::new(connector)))
}
