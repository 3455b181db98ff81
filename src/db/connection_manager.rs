//! PostgreSQL connection manager for bb8 pool
//!
//! Implements the bb8::ManageConnection trait over tokio-postgres clients,
//! maps driver failures into [`DbError`], and forwards errors that happen
//! away from any caller to the pool manager.

use crate::config::DatabaseConfig;
use crate::db::error::{DbError, ErrorClassifier, ServerError};
use crate::db::manager::PoolErrorReporter;
use async_trait::async_trait;
use bb8::{ErrorSink, ManageConnection};
use postgres_native_tls::MakeTlsConnector;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::Client;
use tracing::{debug, error};

/// Trivial query used to confirm a connection is alive and authenticated
pub const PROBE_QUERY: &str = "SELECT 1";

/// Connection manager for PostgreSQL that implements bb8::ManageConnection
pub struct PgConnectionManager {
    pg_config: tokio_postgres::Config,
    tls: MakeTlsConnector,
    classifier: ErrorClassifier,
    reporter: PoolErrorReporter,
}

impl PgConnectionManager {
    /// Build a manager from the connection string in `database`.
    ///
    /// Fails with [`DbError::Configuration`] when the connection string is
    /// missing or malformed; no connection is attempted here.
    pub fn new(
        database: &DatabaseConfig,
        connect_timeout: Duration,
        classifier: ErrorClassifier,
        reporter: PoolErrorReporter,
    ) -> Result<Self, DbError> {
        let url = database
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| DbError::Configuration("DATABASE_URL is not set".to_string()))?;

        let mut pg_config = tokio_postgres::Config::from_str(url)
            .map_err(|e| DbError::Configuration(format!("invalid connection string: {e}")))?;
        pg_config.connect_timeout(connect_timeout);
        pg_config.ssl_mode(if database.tls_enabled() {
            SslMode::Require
        } else {
            SslMode::Disable
        });

        let tls = build_tls_connector()?;

        debug!(
            tls = database.tls_enabled(),
            "Creating PostgreSQL connection manager"
        );

        Ok(Self {
            pg_config,
            tls,
            classifier,
            reporter,
        })
    }

    pub fn classify(&self, err: &tokio_postgres::Error) -> DbError {
        classify_pg_error(&self.classifier, err)
    }

    pub fn reporter(&self) -> &PoolErrorReporter {
        &self.reporter
    }

    /// Open a connection outside of the pool's bookkeeping
    pub async fn connect_client(&self) -> Result<Client, DbError> {
        let (client, connection) = self
            .pg_config
            .connect(self.tls.clone())
            .await
            .map_err(|e| self.classify(&e))?;

        let reporter = self.reporter.clone();
        let classifier = self.classifier.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                reporter.report(classify_pg_error(&classifier, &e));
            }
        });

        Ok(client)
    }
}

/// TLS is only negotiated in production, where certificate and hostname
/// checks are relaxed for managed databases with self-signed chains.
fn build_tls_connector() -> Result<MakeTlsConnector, DbError> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| DbError::Configuration(format!("failed to build TLS connector: {e}")))?;
    Ok(MakeTlsConnector::new(connector))
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = Client;
    type Error = DbError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        debug!("Creating new PostgreSQL connection");

        let client = self.connect_client().await.map_err(|e| {
            error!(code = e.code().unwrap_or("none"), "Failed to create PostgreSQL connection: {}", e);
            e
        })?;

        debug!("Successfully created PostgreSQL connection");
        Ok(client)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query(PROBE_QUERY)
            .await
            .map(|_| ())
            .map_err(|e| self.classify(&e))
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}

impl fmt::Debug for PgConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnectionManager")
            .field("hosts", &self.pg_config.get_hosts())
            .field("dbname", &self.pg_config.get_dbname())
            .field("ssl_mode", &self.pg_config.get_ssl_mode())
            .field("reporter", &self.reporter)
            .finish()
    }
}

impl ErrorSink<DbError> for PoolErrorReporter {
    fn sink(&self, error: DbError) {
        self.report(error);
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<DbError>> {
        Box::new(self.clone())
    }
}

/// Map a tokio-postgres error into the driver-independent taxonomy.
///
/// Server errors keep their SQLSTATE and severity; socket failures get an
/// errno-style code; everything else is an opaque query error.
pub fn classify_pg_error(classifier: &ErrorClassifier, err: &tokio_postgres::Error) -> DbError {
    if let Some(db) = err.as_db_error() {
        return classifier.classify(
            ServerError::new(db.code().code(), db.message()).with_severity(db.severity()),
        );
    }

    match socket_error_code(err) {
        Some(code) => classifier.classify(ServerError::new(code, err.to_string())),
        None => DbError::Query(err.to_string()),
    }
}

fn socket_error_code(err: &(dyn StdError + 'static)) -> Option<&'static str> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return io_error_code(io_err.kind());
        }
        current = e.source();
    }
    None
}

pub(crate) fn io_error_code(kind: io::ErrorKind) -> Option<&'static str> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
        io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
        io::ErrorKind::BrokenPipe => Some("EPIPE"),
        _ => None,
    }
}
