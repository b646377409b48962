//! Native transaction helper

use std::future::Future;
use std::sync::Arc;

use pgmux_core::{Executor, PgmuxError, Result};

const BEGIN: &str = "BEGIN";
const COMMIT: &str = "COMMIT";
const ROLLBACK: &str = "ROLLBACK";

/// Run `f` in a transaction on a connection reserved from `executor`.
///
/// No retry is attempted; the reservation is always released, whether the
/// transaction committed or not.
///
/// # Example
///
/// ```ignore
/// let id = run_in_transaction(&*client, |tx| async move {
///     tx.execute("INSERT INTO events (kind) VALUES ($1)", &["created".into()]).await?;
///     Ok(())
/// })
/// .await?;
/// ```
pub async fn run_in_transaction<T, F, Fut>(executor: &dyn Executor, f: F) -> Result<T>
where
    F: FnOnce(Arc<dyn Executor>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let reserved = executor.reserve().await?;
    let result = in_transaction(reserved.clone(), f).await;

    if let Err(e) = reserved.release().await {
        tracing::warn!(error = %e, "failed to release transaction connection");
    }
    result
}

/// `BEGIN`, `f`, `COMMIT` on one executor; `ROLLBACK` on any failure
pub(crate) async fn in_transaction<T, F, Fut>(executor: Arc<dyn Executor>, f: F) -> Result<T>
where
    F: FnOnce(Arc<dyn Executor>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let outcome = async {
        executor.execute(BEGIN, &[]).await?;
        let value = f(executor.clone()).await?;
        executor.execute(COMMIT, &[]).await?;
        Ok::<T, PgmuxError>(value)
    }
    .await;

    if outcome.is_err() {
        if let Err(e) = executor.execute(ROLLBACK, &[]).await {
            tracing::warn!(error = %e, "rollback failed");
        }
    }
    outcome
}
