//! Per-logical-id connection contexts

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use pgmux_core::{Executor, Result};

#[derive(Default)]
struct ContextState {
    /// Idle dedicated executors, at most one after any operation completes
    available: VecDeque<Arc<dyn Executor>>,
    released: bool,
}

/// Where the executor for one unit of work came from
enum Source {
    /// Popped from, or freshly reserved for, this context
    Dedicated(Arc<dyn Executor>),
    Shared(Arc<dyn Executor>),
}

impl Source {
    fn executor(&self) -> Arc<dyn Executor> {
        match self {
            Source::Dedicated(e) | Source::Shared(e) => e.clone(),
        }
    }
}

/// State for one logical id: a warm reservation slot and a release flag
///
/// Managed contexts are registered with a [`ConnectionMgr`](crate::ConnectionMgr)
/// and keep their idle reservation between calls until released. Unmanaged
/// contexts exist for a single call.
pub struct ConnectionInfo {
    id: String,
    owner_group: Option<String>,
    managed: bool,
    client: Arc<dyn Executor>,
    state: Mutex<ContextState>,
}

impl ConnectionInfo {
    pub fn new(
        id: impl Into<String>,
        owner_group: Option<String>,
        managed: bool,
        client: Arc<dyn Executor>,
    ) -> Self {
        Self {
            id: id.into(),
            owner_group,
            managed,
            client,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_group(&self) -> Option<&str> {
        self.owner_group.as_deref()
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Number of idle dedicated executors held
    pub fn available_count(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Run `action` on an executor chosen for this context.
    ///
    /// An idle dedicated executor is reused first. Otherwise a new one is
    /// reserved when `forced` is set or the context is managed, and the shared
    /// executor is used in the remaining case. Whatever the outcome of
    /// `action`, a dedicated executor is afterwards either kept as the single
    /// idle slot or released to the pool. Closed executors are never kept.
    pub async fn with_reserve<T, F, Fut>(&self, action: F, forced: bool) -> Result<T>
    where
        F: FnOnce(Arc<dyn Executor>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let source = self.acquire(forced).await?;
        let result = action(source.executor()).await;

        if let Source::Dedicated(executor) = source {
            self.put_back(executor).await;
        }
        result
    }

    async fn acquire(&self, forced: bool) -> Result<Source> {
        loop {
            let idle = {
                let mut state = self.state.lock();
                if state.released {
                    None
                } else {
                    state.available.pop_front()
                }
            };
            match idle {
                Some(executor) if executor.is_closed() => {
                    tracing::debug!(id = %self.id, "dropping closed idle connection");
                    release_quietly(&self.id, executor).await;
                }
                Some(executor) => return Ok(Source::Dedicated(executor)),
                None => break,
            }
        }

        if forced || self.managed {
            let executor = self.client.reserve().await?;
            tracing::debug!(id = %self.id, forced, "reserved connection");
            return Ok(Source::Dedicated(executor));
        }

        Ok(Source::Shared(self.client.clone()))
    }

    async fn put_back(&self, executor: Arc<dyn Executor>) {
        let closed = executor.is_closed();
        let surplus = {
            let mut state = self.state.lock();
            if closed || state.released || !state.available.is_empty() {
                Some(executor)
            } else {
                state.available.push_back(executor);
                None
            }
        };

        if let Some(executor) = surplus {
            release_quietly(&self.id, executor).await;
        }
    }

    /// Mark the context released and give every idle executor back.
    ///
    /// Calling it again is a no-op.
    pub async fn release(&self) {
        let idle: Vec<_> = {
            let mut state = self.state.lock();
            state.released = true;
            state.available.drain(..).collect()
        };

        for executor in idle {
            release_quietly(&self.id, executor).await;
        }
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("id", &self.id)
            .field("owner_group", &self.owner_group)
            .field("managed", &self.managed)
            .field("available", &self.available_count())
            .field("released", &self.is_released())
            .finish()
    }
}

async fn release_quietly(id: &str, executor: Arc<dyn Executor>) {
    match executor.release().await {
        Ok(()) => tracing::debug!(%id, "released connection"),
        Err(e) => tracing::warn!(%id, error = %e, "failed to release connection"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExecutor;
    use pgmux_core::PgmuxError;

    #[tokio::test]
    async fn test_unmanaged_unforced_uses_shared_executor() {
        let (client, backend) = MockExecutor::shared();
        let ctx = ConnectionInfo::new("a", None, false, client);

        ctx.with_reserve(|e| async move { e.execute("SELECT 1", &[]).await }, false)
            .await
            .expect("execute");

        assert_eq!(backend.reserved(), 0);
        assert_eq!(backend.shared_statements(), 1);
        assert_eq!(ctx.available_count(), 0);
    }

    #[tokio::test]
    async fn test_forced_reservation_kept_as_idle_slot() {
        let (client, backend) = MockExecutor::shared();
        let ctx = ConnectionInfo::new("a", None, false, client);

        ctx.with_reserve(|e| async move { e.execute("BEGIN", &[]).await }, true)
            .await
            .expect("execute");
        assert_eq!(backend.reserved(), 1);
        assert_eq!(ctx.available_count(), 1);

        // Next call reuses the idle slot instead of reserving
        ctx.with_reserve(|e| async move { e.execute("SELECT 1", &[]).await }, true)
            .await
            .expect("execute");
        assert_eq!(backend.reserved(), 1);
        assert_eq!(ctx.available_count(), 1);
        assert_eq!(backend.shared_statements(), 0);
    }

    #[tokio::test]
    async fn test_managed_context_reserves_without_force() {
        let (client, backend) = MockExecutor::shared();
        let ctx = ConnectionInfo::new("a", Some("grp".into()), true, client);

        ctx.with_reserve(|e| async move { e.execute("SELECT 1", &[]).await }, false)
            .await
            .expect("execute");

        assert_eq!(backend.reserved(), 1);
        assert_eq!(backend.shared_statements(), 0);
        assert_eq!(ctx.owner_group(), Some("grp"));
    }

    #[tokio::test]
    async fn test_action_error_still_returns_executor() {
        let (client, backend) = MockExecutor::shared();
        let ctx = ConnectionInfo::new("a", None, true, client);

        let result: Result<()> = ctx
            .with_reserve(
                |_| async { Err(PgmuxError::database("40001", "serialization failure")) },
                false,
            )
            .await;

        assert!(matches!(result, Err(PgmuxError::Database { .. })));
        assert_eq!(ctx.available_count(), 1);
        assert_eq!(backend.outstanding(), 1);

        ctx.release().await;
        assert_eq!(backend.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_keep_one_idle_slot() {
        let (client, backend) = MockExecutor::shared();
        let ctx = Arc::new(ConnectionInfo::new("a", None, true, client));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    ctx.with_reserve(|e| async move { e.execute("SELECT 1", &[]).await }, false)
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("execute");
        }

        // Every call reserved before any finished; all but one went back
        assert_eq!(backend.reserved(), 4);
        assert_eq!(backend.released(), 3);
        assert_eq!(ctx.available_count(), 1);
        assert_eq!(backend.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_release_drops_idle_and_stops_pooling() {
        let (client, backend) = MockExecutor::shared();
        let ctx = ConnectionInfo::new("a", None, true, client);

        ctx.with_reserve(|e| async move { e.execute("SELECT 1", &[]).await }, false)
            .await
            .expect("execute");
        ctx.release().await;
        assert!(ctx.is_released());
        assert_eq!(ctx.available_count(), 0);

        // Work after release still runs, but nothing is kept
        ctx.with_reserve(|e| async move { e.execute("SELECT 2", &[]).await }, false)
            .await
            .expect("execute");
        assert_eq!(ctx.available_count(), 0);
        assert_eq!(backend.outstanding(), 0);

        ctx.release().await;
    }

    #[tokio::test]
    async fn test_release_failure_is_swallowed() {
        let (client, backend) = MockExecutor::shared();
        backend.set_fail_release(true);
        let ctx = ConnectionInfo::new("a", None, true, client);

        ctx.with_reserve(|e| async move { e.execute("SELECT 1", &[]).await }, false)
            .await
            .expect("execute");
        ctx.release().await;

        assert!(ctx.is_released());
        assert_eq!(backend.released(), 1);
    }
}
