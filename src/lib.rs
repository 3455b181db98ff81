pub mod config;
pub mod db;
pub mod error;
pub mod logging;

pub use config::{Config, DatabaseConfig, LoggingConfig, PoolConfig};
pub use db::{
    ConnectionPool, DbError, PgBackend, PoolBackend, PoolErrorReporter, PoolManager, PoolStats,
    ServerError,
};
pub use error::{PoolError, Result};
