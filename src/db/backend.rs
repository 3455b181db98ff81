//! The seam between the pool manager and a concrete database driver

use crate::config::{DatabaseConfig, PoolConfig};
use crate::db::error::DbError;
use crate::db::manager::PoolErrorReporter;
use crate::db::pool::ConnectionPool;
use async_trait::async_trait;

/// A driver that can build, probe and close connection pools.
///
/// The manager owns the lifecycle (caching, retry, invalidation); a backend
/// only knows how to talk to the database. `Pool` is a cheap, cloneable
/// handle that all callers share.
#[async_trait]
pub trait PoolBackend: Send + Sync + 'static {
    type Pool: Clone + Send + Sync + 'static;

    /// Construct a pool. Must not require a live server; connectivity is
    /// checked by [`probe`](Self::probe). Errors that surface later on idle
    /// connections are delivered through `reporter`.
    async fn create(
        &self,
        config: &PoolConfig,
        reporter: PoolErrorReporter,
    ) -> Result<Self::Pool, DbError>;

    /// Open one connection, run a liveness query and release it.
    async fn probe(&self, pool: &Self::Pool) -> Result<(), DbError>;

    /// Release every connection held by the pool.
    async fn close(&self, pool: Self::Pool) -> Result<(), DbError>;
}

/// PostgreSQL backend built on bb8 and tokio-postgres
#[derive(Debug, Clone)]
pub struct PgBackend {
    database: DatabaseConfig,
}

impl PgBackend {
    pub fn new(database: DatabaseConfig) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.database
    }
}

#[async_trait]
impl PoolBackend for PgBackend {
    type Pool = ConnectionPool;

    async fn create(
        &self,
        config: &PoolConfig,
        reporter: PoolErrorReporter,
    ) -> Result<ConnectionPool, DbError> {
        ConnectionPool::new(&self.database, config.clone(), reporter)
    }

    async fn probe(&self, pool: &ConnectionPool) -> Result<(), DbError> {
        pool.probe().await
    }

    async fn close(&self, pool: ConnectionPool) -> Result<(), DbError> {
        pool.close().await
    }
}
