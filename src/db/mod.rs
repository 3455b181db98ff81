//! Database connection pooling module
//!
//! This module owns the lifecycle of the shared PostgreSQL pool, built on
//! the bb8 connection pool library and tokio-postgres.

pub mod backend;
pub mod connection_manager;
pub mod error;
pub mod manager;
pub mod pool;

pub use backend::{PgBackend, PoolBackend};
pub use connection_manager::{PgConnectionManager, PROBE_QUERY};
pub use error::{DbError, ErrorClassifier, ServerError};
pub use manager::{PoolErrorReporter, PoolManager};
pub use pool::{ConnectionPool, PoolStats};

// Re-export common types for convenience
pub use bb8::PooledConnection;
