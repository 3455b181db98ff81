//! Process-wide owner of the shared database pool
//!
//! [`PoolManager`] lazily builds one pool, verifies it with a probe query
//! (retrying transient failures a bounded number of times), hands the same
//! instance to every caller, rebuilds it after a background failure and
//! releases it on shutdown.
//!
//! Construct one manager at the composition root and pass clones of it to
//! whatever needs database access.

use crate::config::{Config, PoolConfig};
use crate::db::backend::{PgBackend, PoolBackend};
use crate::db::error::DbError;
use crate::error::PoolError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

/// Receives errors raised by a pool outside of any caller's request.
pub(crate) trait PoolErrorHandler: Send + Sync {
    fn handle_pool_error(&self, epoch: u64, error: DbError);
}

/// Handle given to a backend so it can report asynchronous pool errors.
///
/// Each reporter is bound to the pool epoch it was created for; reports from
/// a pool that has since been replaced do not affect the current one.
#[derive(Clone)]
pub struct PoolErrorReporter {
    epoch: u64,
    handler: Weak<dyn PoolErrorHandler>,
}

impl PoolErrorReporter {
    /// Reporter that is not attached to any manager. Reports are dropped.
    pub fn detached() -> Self {
        let handler: Weak<dyn PoolErrorHandler> = Weak::<Detached>::new();
        Self { epoch: 0, handler }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn report(&self, error: DbError) {
        match self.handler.upgrade() {
            Some(handler) => handler.handle_pool_error(self.epoch, error),
            None => debug!(epoch = self.epoch, %error, "Pool error reported after manager was dropped"),
        }
    }
}

impl fmt::Debug for PoolErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolErrorReporter")
            .field("epoch", &self.epoch)
            .finish()
    }
}

struct Detached;

impl PoolErrorHandler for Detached {
    fn handle_pool_error(&self, _epoch: u64, _error: DbError) {}
}

struct CachedPool<P> {
    epoch: u64,
    pool: P,
}

type SharedBuild<P> = Shared<BoxFuture<'static, Result<P, PoolError>>>;

/// The construction every concurrent caller is waiting on
struct InFlight<P> {
    epoch: u64,
    build: SharedBuild<P>,
}

struct Inner<B: PoolBackend> {
    backend: Arc<B>,
    config: PoolConfig,
    active: RwLock<Option<CachedPool<B::Pool>>>,
    in_flight: Mutex<Option<InFlight<B::Pool>>>,
    shutdown_signal: Notify,
    retry_count: AtomicU32,
    shutting_down: AtomicBool,
    epoch: AtomicU64,
    invalidations: AtomicU64,
}

impl<B: PoolBackend> Inner<B> {
    fn cached(&self) -> Option<B::Pool> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|cached| cached.pool.clone())
    }

    fn pending_build(&self) -> Option<SharedBuild<B::Pool>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|current| current.build.clone())
    }

    fn take_cached(&self) -> Option<CachedPool<B::Pool>> {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<B: PoolBackend> PoolErrorHandler for Inner<B> {
    fn handle_pool_error(&self, epoch: u64, err: DbError) {
        // Closing a pool makes its connections error out
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(epoch, %err, "Ignoring pool error during shutdown");
            return;
        }

        let discarded = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            if active.as_ref().is_some_and(|cached| cached.epoch == epoch) {
                active.take()
            } else {
                None
            }
        };

        let Some(cached) = discarded else {
            debug!(epoch, %err, "Ignoring error from a pool that is no longer cached");
            return;
        };

        error!(
            epoch,
            code = err.code().unwrap_or("none"),
            severity = err.severity().unwrap_or("none"),
            error = %err,
            "Unexpected error on idle database connection"
        );

        self.invalidations.fetch_add(1, Ordering::SeqCst);
        warn!(epoch, "Discarding pool; the next acquisition will rebuild it");

        let backend = Arc::clone(&self.backend);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.close(cached.pool).await {
                        warn!(epoch, error = %e, "Error closing invalidated pool");
                    }
                });
            }
            Err(_) => drop(cached),
        }
    }
}

/// Owns zero or one verified pool and shares it with every caller.
pub struct PoolManager<B: PoolBackend = PgBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: PoolBackend> Clone for PoolManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: PoolBackend> fmt::Debug for PoolManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("cached", &self.is_cached())
            .field("retry_count", &self.retry_count())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl PoolManager<PgBackend> {
    /// Manager for the PostgreSQL database described by `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(PgBackend::new(config.database.clone()), config.pool.clone())
    }
}

impl<B: PoolBackend> PoolManager<B> {
    pub fn new(backend: B, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: Arc::new(backend),
                config,
                active: RwLock::new(None),
                in_flight: Mutex::new(None),
                shutdown_signal: Notify::new(),
                retry_count: AtomicU32::new(0),
                shutting_down: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                invalidations: AtomicU64::new(0),
            }),
        }
    }

    /// Get the shared pool, building and verifying it on first use.
    ///
    /// Concurrent callers that arrive while a pool is being built wait for
    /// that one construction and all receive its outcome, success or failure.
    /// A failed construction leaves nothing cached, so a later call starts
    /// over.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<B::Pool, PoolError> {
        if let Some(pool) = self.inner.cached() {
            return Ok(pool);
        }

        let build = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            // A build may have finished between the fast path and the lock
            if let Some(pool) = self.inner.cached() {
                return Ok(pool);
            }

            match in_flight.as_ref() {
                Some(current) => {
                    debug!(epoch = current.epoch, "Waiting for in-flight pool construction");
                    current.build.clone()
                }
                None => {
                    let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    let build = self.clone().build(epoch).boxed().shared();
                    *in_flight = Some(InFlight {
                        epoch,
                        build: build.clone(),
                    });
                    build
                }
            }
        };

        build.await
    }

    /// Run one construction to completion and publish its result.
    async fn build(self, epoch: u64) -> Result<B::Pool, PoolError> {
        let result = self.construct(epoch).await;

        if let Ok(pool) = &result {
            *self.inner.active.write().unwrap_or_else(PoisonError::into_inner) = Some(CachedPool {
                epoch,
                pool: pool.clone(),
            });
            info!(epoch, "Database connection pool ready");
        }

        // Publish before clearing the slot
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if in_flight.as_ref().is_some_and(|current| current.epoch == epoch) {
            *in_flight = None;
        }

        result
    }

    async fn construct(&self, epoch: u64) -> Result<B::Pool, PoolError> {
        info!(
            epoch,
            max_size = self.inner.config.max_size,
            "Creating database connection pool"
        );

        let pool = self
            .inner
            .backend
            .create(&self.inner.config, self.reporter(epoch))
            .await
            .map_err(|e| {
                error!(epoch, error = %e, "Failed to construct connection pool");
                PoolError::from_db(e, 0, self.inner.config.max_retries)
            })?;

        self.inner.retry_count.store(0, Ordering::SeqCst);

        if let Err(e) = self.verify(&pool).await {
            self.inner.retry_count.store(0, Ordering::SeqCst);
            if let Err(close_err) = self.inner.backend.close(pool).await {
                warn!(epoch, error = %close_err, "Error closing unverified pool");
            }
            return Err(e);
        }

        Ok(pool)
    }

    /// Probe the pool until it answers, retrying transient failures.
    ///
    /// Runs at most `max_retries + 1` probes separated by `retry_delay`.
    #[instrument(skip(self, pool))]
    async fn verify(&self, pool: &B::Pool) -> Result<(), PoolError> {
        let max_retries = self.inner.config.max_retries;

        loop {
            let err = match self.inner.backend.probe(pool).await {
                Ok(()) => {
                    self.inner.retry_count.store(0, Ordering::SeqCst);
                    debug!("Connection probe succeeded");
                    return Ok(());
                }
                Err(err) => err,
            };

            let attempts = self.inner.retry_count.load(Ordering::SeqCst);
            if err.is_retryable() && attempts < max_retries {
                let attempt = attempts + 1;
                self.inner.retry_count.store(attempt, Ordering::SeqCst);
                warn!(
                    attempt,
                    max_retries,
                    code = err.code().unwrap_or("none"),
                    error = %err,
                    "Database connection probe failed, retrying in {:?}",
                    self.inner.config.retry_delay()
                );

                let signal = self.inner.shutdown_signal.notified();
                tokio::pin!(signal);
                signal.as_mut().enable();

                let interrupted = self.inner.shutting_down.load(Ordering::SeqCst)
                    || tokio::select! {
                        _ = tokio::time::sleep(self.inner.config.retry_delay()) => false,
                        _ = &mut signal => true,
                    };
                if !interrupted {
                    continue;
                }

                info!(attempts, "Shutdown requested; abandoning connection retries");
                return Err(PoolError::from_db(err, attempts, max_retries));
            }

            error!(
                attempts,
                max_retries,
                retryable = err.is_retryable(),
                error = %err,
                "Database connection could not be established"
            );
            return Err(PoolError::from_db(err, attempts, max_retries));
        }
    }

    /// Release the cached pool. Errors while closing are logged, not returned.
    ///
    /// A construction waiting between retries is cut short and fails.
    ///
    /// The manager stays usable: the next [`acquire`](Self::acquire) builds a
    /// new pool.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.shutdown_signal.notify_waiters();

        // Let an in-flight construction finish so its pool gets closed too
        if let Some(build) = self.inner.pending_build() {
            debug!("Waiting for in-flight pool construction before closing");
            let _ = build.await;
        }

        match self.inner.take_cached() {
            Some(cached) => {
                info!(epoch = cached.epoch, "Closing database connection pool");
                if let Err(e) = self.inner.backend.close(cached.pool).await {
                    warn!(epoch = cached.epoch, error = %e, "Error closing pool during shutdown");
                }
            }
            None => debug!("Shutdown requested with no active pool"),
        }

        self.inner.retry_count.store(0, Ordering::SeqCst);
        self.inner.shutting_down.store(false, Ordering::SeqCst);
        info!("Pool manager shut down");
    }

    fn reporter(&self, epoch: u64) -> PoolErrorReporter {
        let handler: Arc<dyn PoolErrorHandler> = self.inner.clone();
        PoolErrorReporter {
            epoch,
            handler: Arc::downgrade(&handler),
        }
    }

    pub fn is_cached(&self) -> bool {
        self.inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Number of pools discarded because of background errors
    pub fn invalidation_count(&self) -> u64 {
        self.inner.invalidations.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }
}
