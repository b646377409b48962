//! Logical connection manager
//!
//! A [`ConnectionMgr`] is bound to one physical pool. It runs transactional
//! and read work for logical ids, retrying transient failures, and keeps the
//! registry of managed [`ConnectionInfo`] contexts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use pgmux_core::{Executor, Result};

use crate::context::ConnectionInfo;
use crate::retry::RetryPolicy;
use crate::transaction::in_transaction;

/// Runs work for logical ids over a shared executor
pub struct ConnectionMgr {
    /// Shared executor of the physical pool
    client: Arc<dyn Executor>,
    /// Managed contexts by logical id
    connections: Mutex<HashMap<String, Arc<ConnectionInfo>>>,
    policy: RetryPolicy,
    next_adhoc: AtomicU64,
}

impl ConnectionMgr {
    /// Create a manager with the default retry policy
    pub fn new(client: Arc<dyn Executor>) -> Self {
        Self::with_policy(client, RetryPolicy::default())
    }

    pub fn with_policy(client: Arc<dyn Executor>, policy: RetryPolicy) -> Self {
        Self {
            client,
            connections: Mutex::new(HashMap::new()),
            policy,
            next_adhoc: AtomicU64::new(1),
        }
    }

    /// Shared executor this manager runs work on
    pub fn client(&self) -> &Arc<dyn Executor> {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of registered (managed) contexts
    pub fn context_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Whether a managed context is registered for `id`
    pub fn contains(&self, id: &str) -> bool {
        self.connections.lock().contains_key(id)
    }

    /// Registered context for `id`, or a new one.
    ///
    /// A new context is registered only when `managed` is set; otherwise it
    /// lives as long as the caller holds it.
    pub fn get_connection(
        &self,
        id: &str,
        owner_group: Option<&str>,
        managed: bool,
    ) -> Arc<ConnectionInfo> {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(id) {
            return existing.clone();
        }

        let info = Arc::new(ConnectionInfo::new(
            id,
            owner_group.map(str::to_string),
            managed,
            self.client.clone(),
        ));
        if managed {
            connections.insert(id.to_string(), info.clone());
            tracing::debug!(%id, ?owner_group, "registered managed connection");
        }
        info
    }

    fn adhoc_id(&self) -> String {
        format!("adhoc-{}", self.next_adhoc.fetch_add(1, Ordering::Relaxed))
    }

    /// Run `f` inside `BEGIN`/`COMMIT` on a dedicated connection.
    ///
    /// Any failure rolls the transaction back. Retryable failures are retried
    /// up to the policy's attempt limit with its backoff between attempts;
    /// the last error is returned unchanged. `f` may run several times.
    #[tracing::instrument(skip_all, fields(id = ?id, owner_group = ?owner_group))]
    pub async fn write<T, F, Fut>(&self, id: Option<&str>, owner_group: Option<&str>, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn Executor>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = id.map_or_else(|| self.adhoc_id(), str::to_string);
        let ctx = self.get_connection(&id, owner_group, false);
        let f = &f;

        let result = self
            .run_attempts(|| {
                ctx.with_reserve(
                    |executor| async move { in_transaction(executor, f).await },
                    true,
                )
            })
            .await;

        if !ctx.is_managed() {
            ctx.release().await;
        }
        result
    }

    /// Run `f` without transaction framing, retrying transient failures.
    ///
    /// Uses the context's idle reservation when it has one, a new reservation
    /// for managed contexts, and the shared executor otherwise.
    #[tracing::instrument(skip_all, fields(id = ?id, owner_group = ?owner_group))]
    pub async fn retry<T, F, Fut>(&self, id: Option<&str>, owner_group: Option<&str>, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn Executor>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = id.map_or_else(|| self.adhoc_id(), str::to_string);
        let ctx = self.get_connection(&id, owner_group, false);
        let f = &f;

        let result = self
            .run_attempts(|| ctx.with_reserve(|executor| f(executor), false))
            .await;

        if !ctx.is_managed() {
            ctx.release().await;
        }
        result
    }

    async fn run_attempts<T, A, Fut>(&self, attempt_fn: A) -> Result<T>
    where
        A: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) if self.policy.should_retry(attempt, &e) => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        code = e.code().unwrap_or_default(),
                        error = %e,
                        ?delay,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "giving up");
                    return Err(e);
                }
            }
        }
    }

    /// Release the managed context for `id`, returning its idle connection to
    /// the pool. Unknown ids are ignored.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, id: &str) {
        let removed = self.connections.lock().remove(id);
        match removed {
            Some(ctx) => ctx.release().await,
            None => tracing::debug!("no managed connection to release"),
        }
    }

    /// Release every managed context, or only those of `owner_group`
    #[tracing::instrument(skip(self))]
    pub async fn close(&self, owner_group: Option<&str>) {
        let removed: Vec<Arc<ConnectionInfo>> = {
            let mut connections = self.connections.lock();
            let ids: Vec<String> = connections
                .values()
                .filter(|ctx| owner_group.is_none() || ctx.owner_group() == owner_group)
                .map(|ctx| ctx.id().to_string())
                .collect();
            ids.iter()
                .filter_map(|id| connections.remove(id))
                .collect()
        };

        tracing::debug!(count = removed.len(), "closing managed connections");
        for ctx in removed {
            ctx.release().await;
        }
    }
}
