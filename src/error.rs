use crate::db::error::DbError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors returned to callers of the pool manager
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Database configuration error: {0}")]
    Configuration(String),

    /// The pool could not be built or verified. `attempts` is the number of
    /// retries performed before giving up.
    #[error("Failed to connect to database after {attempts} retries (max {max_retries}): {source}")]
    Connection {
        attempts: u32,
        max_retries: u32,
        #[source]
        source: DbError,
    },

    #[error("Timeout waiting for connection")]
    Timeout,

    #[error("Failed to get connection from pool: {0}")]
    GetConnection(#[source] DbError),
}

impl PoolError {
    /// Wrap a driver error raised while establishing a pool
    pub fn from_db(err: DbError, attempts: u32, max_retries: u32) -> Self {
        match err {
            DbError::Configuration(msg) => PoolError::Configuration(msg),
            source => PoolError::Connection {
                attempts,
                max_retries,
                source,
            },
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, PoolError::Configuration(_))
    }

    /// The underlying driver error, when there is one
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            PoolError::Connection { source, .. } | PoolError::GetConnection(source) => Some(source),
            _ => None,
        }
    }
}
