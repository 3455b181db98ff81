//! Connection pool wrapper for PostgreSQL
//!
//! Provides a simple interface over the bb8 connection pool with a
//! liveness probe and basic statistics.

use crate::config::{DatabaseConfig, PoolConfig};
use crate::db::connection_manager::{classify_pg_error, PgConnectionManager, PROBE_QUERY};
use crate::db::error::{DbError, ErrorClassifier};
use crate::db::manager::PoolErrorReporter;
use crate::error::PoolError;
use bb8::{Pool, PooledConnection};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Connection pool statistics for monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    /// Current number of connections in pool
    pub size: u32,
    /// Number of idle connections
    pub idle_connections: u32,
    /// Number of connections checked out by callers
    pub active_connections: u32,
    /// Pool configuration max size
    pub max_size: u32,
}

impl PoolStats {
    pub fn utilization_percent(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        f64::from(self.active_connections) / f64::from(self.max_size) * 100.0
    }
}

/// Shared handle to a bb8 pool of PostgreSQL connections.
///
/// Cloning is cheap; every clone refers to the same set of connections.
#[derive(Clone)]
pub struct ConnectionPool {
    pool: Pool<PgConnectionManager>,
    config: Arc<PoolConfig>,
    classifier: ErrorClassifier,
}

impl ConnectionPool {
    /// Create a pool without opening any connection.
    ///
    /// Connections are established on demand; use [`probe`](Self::probe) to
    /// check that the database is reachable.
    #[instrument(skip_all, fields(max_size = pool_config.max_size))]
    pub fn new(
        database: &DatabaseConfig,
        pool_config: PoolConfig,
        reporter: PoolErrorReporter,
    ) -> Result<Self, DbError> {
        let classifier = ErrorClassifier::new(pool_config.retryable_error_codes.iter().cloned());
        let manager = PgConnectionManager::new(
            database,
            pool_config.connection_timeout(),
            classifier.clone(),
            reporter.clone(),
        )?;

        let pool = Pool::<PgConnectionManager>::builder()
            .max_size(pool_config.max_size)
            .min_idle(None)
            .connection_timeout(pool_config.connection_timeout())
            .idle_timeout(Some(pool_config.idle_timeout()))
            .test_on_check_out(true)
            .error_sink(Box::new(reporter))
            .build_unchecked(manager);

        info!(
            max_size = pool_config.max_size,
            tls = database.tls_enabled(),
            "Created PostgreSQL connection pool"
        );

        Ok(Self {
            pool,
            config: Arc::new(pool_config),
            classifier,
        })
    }

    /// Get a connection from the pool
    ///
    /// The connection is automatically returned to the pool when dropped.
    #[instrument(skip(self))]
    pub async fn get_connection(
        &self,
    ) -> Result<PooledConnection<'_, PgConnectionManager>, PoolError> {
        debug!("Acquiring connection from pool");

        match self.pool.get().await {
            Ok(conn) => Ok(conn),
            Err(bb8::RunError::User(e)) => {
                warn!(error = %e, "Connection manager error");
                Err(PoolError::GetConnection(e))
            }
            Err(bb8::RunError::TimedOut) => {
                warn!("Connection pool timeout - consider increasing pool size or timeout");
                Err(PoolError::Timeout)
            }
        }
    }

    /// Open one connection, run the probe query and release it.
    ///
    /// Uses a dedicated connection so the server's own error (refused,
    /// authentication failure, ...) reaches the caller instead of a generic
    /// pool timeout.
    #[instrument(skip(self))]
    pub async fn probe(&self) -> Result<(), DbError> {
        let timeout = self.config.connection_timeout();

        let round_trip = async {
            let client = self.pool.dedicated_connection().await?;
            client
                .simple_query(PROBE_QUERY)
                .await
                .map_err(|e| classify_pg_error(&self.classifier, &e))?;
            Ok::<_, DbError>(())
        };

        tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| DbError::Query(format!("probe timed out after {timeout:?}")))??;

        debug!("Probe query succeeded");
        Ok(())
    }

    /// Get connection pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.pool.state();

        PoolStats {
            size: state.connections,
            idle_connections: state.idle_connections,
            active_connections: state.connections.saturating_sub(state.idle_connections),
            max_size: self.config.max_size,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Release this handle's share of the pool.
    ///
    /// bb8 has no explicit close; connections are dropped once the last
    /// handle goes away and checked-out connections are returned.
    #[instrument(skip(self))]
    pub async fn close(self) -> Result<(), DbError> {
        let stats = self.stats();
        info!(
            connections = stats.size,
            active = stats.active_connections,
            "Shutting down connection pool"
        );

        drop(self.pool);

        Ok(())
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("pool", &"Pool<PgConnectionManager>")
            .field("stats", &self.stats())
            .finish()
    }
}
