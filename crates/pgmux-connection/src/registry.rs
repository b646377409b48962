//! Shared pool handles and leases
//!
//! A [`PoolRegistry`] keeps one physical pool per connection string and
//! effective options. Every [`PoolRegistry::acquire`] returns a [`ClientRef`]
//! lease on the shared [`PoolHandle`]; the pool is torn down when the last
//! lease is closed.
//!
//! # Example
//!
//! ```ignore
//! let registry = PoolRegistry::from_env(Arc::new(PostgresConnector::new()))?;
//! let lease = registry.acquire("postgres://localhost/app", None, Some("indexer"))?;
//!
//! lease
//!     .mgr()
//!     .write(None, None, |tx| async move {
//!         tx.execute("UPDATE jobs SET done = true", &[]).await
//!     })
//!     .await?;
//!
//! lease.close();
//! registry.shutdown().await;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pgmux_core::{
    Executor, PgmuxError, PhysicalPool, PoolConnector, PoolOptions, PoolOptionsOverride,
    PoolStats, Result, merge_options,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::manager::ConnectionMgr;
use crate::retry::RetryPolicy;

#[derive(Default)]
struct RegistryState {
    /// Live handles by pool key
    handles: HashMap<String, Arc<PoolHandle>>,
    /// Open leases by id
    leases: HashMap<u64, Arc<PoolHandle>>,
    /// Process-wide override set at runtime
    options_override: Option<PoolOptionsOverride>,
    policy: RetryPolicy,
}

/// Counts teardown tasks still running
#[derive(Default)]
struct Teardowns {
    running: AtomicUsize,
    finished: Notify,
}

impl Teardowns {
    async fn wait_idle(&self) {
        loop {
            let notified = self.finished.notified();
            if self.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct RegistryInner {
    connector: Arc<dyn PoolConnector>,
    env_override: Option<PoolOptionsOverride>,
    state: Mutex<RegistryState>,
    teardowns: Arc<Teardowns>,
    next_lease: AtomicU64,
}

/// Registry of shared physical pools
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct PoolRegistry {
    inner: Arc<RegistryInner>,
}

impl PoolRegistry {
    /// Registry with default pool options and retry policy
    pub fn new(connector: Arc<dyn PoolConnector>) -> Self {
        Self::build(connector, None, None)
    }

    /// Registry with a process-wide options override
    pub fn with_options(connector: Arc<dyn PoolConnector>, overrides: PoolOptionsOverride) -> Self {
        Self::build(connector, None, Some(overrides))
    }

    /// Registry that layers the `PGMUX_POOL_OPTIONS` environment override
    /// over the defaults
    pub fn from_env(connector: Arc<dyn PoolConnector>) -> Result<Self> {
        let env_override = PoolOptionsOverride::from_env()?;
        if env_override.is_some() {
            tracing::debug!("using pool options from environment");
        }
        Ok(Self::build(connector, env_override, None))
    }

    fn build(
        connector: Arc<dyn PoolConnector>,
        env_override: Option<PoolOptionsOverride>,
        options_override: Option<PoolOptionsOverride>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connector,
                env_override,
                state: Mutex::new(RegistryState {
                    options_override,
                    ..Default::default()
                }),
                teardowns: Arc::new(Teardowns::default()),
                next_lease: AtomicU64::new(1),
            }),
        }
    }

    /// Retry policy for managers of pools created from now on
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        self.inner.state.lock().policy = policy;
    }

    /// Replace the process-wide options override for future acquisitions
    pub fn set_options_override(&self, overrides: Option<PoolOptionsOverride>) {
        self.inner.state.lock().options_override = overrides;
    }

    /// Options a pool acquired with these per-call values would use
    pub fn effective_options(&self, database: Option<&str>, service_tag: Option<&str>) -> PoolOptions {
        let registry_override = self.inner.state.lock().options_override.clone();
        let per_call = PoolOptionsOverride::per_call(database, service_tag);
        merge_options(
            self.inner
                .env_override
                .iter()
                .chain(registry_override.iter())
                .chain(std::iter::once(&per_call)),
        )
    }

    /// Lease the shared pool for `connection_string`, creating it on first use
    #[tracing::instrument(skip(self, connection_string), fields(url = %redact(connection_string)))]
    pub fn acquire(
        &self,
        connection_string: &str,
        database: Option<&str>,
        service_tag: Option<&str>,
    ) -> Result<ClientRef> {
        let options = self.effective_options(database, service_tag);
        options.validate()?;
        let key = pool_key(connection_string, &options);

        let mut state = self.inner.state.lock();
        let handle = match state.handles.get(&key) {
            Some(handle) => handle.clone(),
            None => {
                let pool = self.inner.connector.connect(connection_string, &options)?;
                let mgr = Arc::new(ConnectionMgr::with_policy(
                    pool.executor(),
                    state.policy.clone(),
                ));
                let handle = Arc::new(PoolHandle {
                    key: key.clone(),
                    url: connection_string.to_string(),
                    options,
                    pool,
                    mgr,
                    refs: AtomicUsize::new(0),
                    torn_down: AtomicBool::new(false),
                    registry: Arc::downgrade(&self.inner),
                });
                state.handles.insert(key, handle.clone());
                tracing::info!("created shared pool");
                handle
            }
        };

        let refs = handle.refs.fetch_add(1, Ordering::SeqCst) + 1;
        let id = self.inner.next_lease.fetch_add(1, Ordering::SeqCst);
        state.leases.insert(id, handle.clone());
        tracing::debug!(lease = id, refs, "leased shared pool");

        Ok(ClientRef {
            id,
            handle,
            closed: AtomicBool::new(false),
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Number of live shared pools
    pub fn live_handles(&self) -> usize {
        self.inner.state.lock().handles.len()
    }

    /// Number of open leases
    pub fn live_leases(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    /// Reference count of the live handle for `key`
    pub fn handle_ref_count(&self, key: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .handles
            .get(key)
            .map(|handle| handle.ref_count())
    }

    /// Force-close every live pool and wait for all teardowns to finish
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<PoolHandle>> = {
            let mut state = self.inner.state.lock();
            state.leases.clear();
            state.handles.values().cloned().collect()
        };

        tracing::info!(pools = handles.len(), "shutting down shared pools");
        for handle in handles {
            handle.close(true);
        }
        self.inner.teardowns.wait_idle().await;
    }
}

fn pool_key(connection_string: &str, options: &PoolOptions) -> String {
    format!("{}#{}", connection_string, options.fingerprint())
}

/// Connection string with any password masked, for logs
fn redact(connection_string: &str) -> String {
    let Some((scheme, rest)) = connection_string.split_once("://") else {
        return connection_string.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return connection_string.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => connection_string.to_string(),
    }
}

/// A physical pool shared by every lease with the same key
pub struct PoolHandle {
    key: String,
    url: String,
    options: PoolOptions,
    pool: Arc<dyn PhysicalPool>,
    mgr: Arc<ConnectionMgr>,
    /// Changed only under the registry lock
    refs: AtomicUsize,
    torn_down: AtomicBool,
    registry: Weak<RegistryInner>,
}

impl PoolHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn mgr(&self) -> &Arc<ConnectionMgr> {
        &self.mgr
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Drop one reference, or all of them when `force` is set.
    ///
    /// When no reference remains the handle leaves the registry and its pool
    /// is torn down in the background; the teardown task is returned.
    pub fn close(&self, force: bool) -> Option<JoinHandle<()>> {
        let registry = self.registry.upgrade();
        let remaining = match &registry {
            Some(registry) => {
                let mut state = registry.state.lock();
                let remaining = self.decrement(force);
                if remaining == 0
                    && state
                        .handles
                        .get(&self.key)
                        .is_some_and(|live| std::ptr::eq(live.as_ref(), self))
                {
                    state.handles.remove(&self.key);
                }
                remaining
            }
            None => self.decrement(force),
        };

        tracing::debug!(refs = remaining, force, "released shared pool reference");
        if remaining > 0 {
            return None;
        }
        self.schedule_teardown(registry.map(|r| r.teardowns.clone()))
    }

    fn decrement(&self, force: bool) -> usize {
        if force {
            self.refs.store(0, Ordering::SeqCst);
            return 0;
        }
        let current = self.refs.load(Ordering::SeqCst);
        let remaining = current.saturating_sub(1);
        self.refs.store(remaining, Ordering::SeqCst);
        remaining
    }

    fn schedule_teardown(&self, teardowns: Option<Arc<Teardowns>>) -> Option<JoinHandle<()>> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return None;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!(url = %redact(&self.url), "no runtime, skipping pool teardown");
                return None;
            }
        };

        let mgr = self.mgr.clone();
        let pool = self.pool.clone();
        let timeout = self.options.drain_timeout();
        let url = redact(&self.url);
        if let Some(teardowns) = &teardowns {
            teardowns.running.fetch_add(1, Ordering::SeqCst);
        }

        Some(runtime.spawn(async move {
            mgr.close(None).await;
            pool.drain(timeout).await;
            tracing::info!(%url, "shared pool closed");

            if let Some(teardowns) = teardowns {
                teardowns.running.fetch_sub(1, Ordering::SeqCst);
                teardowns.finished.notify_waiters();
            }
        }))
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("url", &redact(&self.url))
            .field("refs", &self.ref_count())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

/// One lease on a shared pool
pub struct ClientRef {
    id: u64,
    handle: Arc<PoolHandle>,
    closed: AtomicBool,
    registry: Weak<RegistryInner>,
}

impl ClientRef {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        self.handle.url()
    }

    pub fn handle(&self) -> &Arc<PoolHandle> {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shared executor of the leased pool
    pub fn get_client(&self) -> Result<Arc<dyn Executor>> {
        if self.is_closed() {
            return Err(PgmuxError::LeaseClosed);
        }
        Ok(self.handle.mgr().client().clone())
    }

    /// Manager bound to the leased pool
    pub fn mgr(&self) -> Arc<ConnectionMgr> {
        self.handle.mgr().clone()
    }

    /// Give the lease back. Only the first call has an effect.
    ///
    /// Returns the teardown task when this was the last lease on the pool.
    pub fn close(&self) -> Option<JoinHandle<()>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.state.lock().leases.remove(&self.id);
        }
        self.handle.close(false)
    }
}

impl fmt::Debug for ClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRef")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("closed", &self.is_closed())
            .finish()
    }
}
