//! Physical connection trait

use crate::{QueryResult, Result, Value};
use async_trait::async_trait;

/// A single physical connection to the backend
///
/// Drivers implement this; pools hand out instances of it. A connection is
/// used by one caller at a time.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the driver name (e.g. "postgres")
    fn driver_name(&self) -> &str;

    /// Run a parameterized statement and return its rows and row count
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Whether the driver binds `Value::Array` parameters natively.
    ///
    /// When false, array parameters are converted to array literals before
    /// they reach [`Connection::execute`].
    fn supports_native_arrays(&self) -> bool {
        false
    }
}
