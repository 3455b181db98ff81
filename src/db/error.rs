//! Driver-level error taxonomy
//!
//! Every failure coming out of the database client adapter is mapped into
//! [`DbError`], a closed set of variants. Retry decisions are made by
//! matching on the variant rather than by inspecting error shapes.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A database-shaped error: the server (or the socket layer) attached a code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// SQLSTATE (`57P01`) or errno-style (`ECONNREFUSED`) code
    pub code: String,
    /// Server severity (`FATAL`, `ERROR`, ...) when the server sent one
    pub severity: Option<String>,
    pub message: String,
}

impl ServerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity: None,
            message: message.into(),
        }
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = Some(severity.into());
        self
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.severity {
            Some(severity) => write!(f, "{} [{}]: {}", self.code, severity, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// Errors produced by the database client adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Database configuration error: {0}")]
    Configuration(String),

    #[error("Transient database error {0}")]
    Transient(ServerError),

    #[error("Permanent database error {0}")]
    Permanent(ServerError),

    #[error("Database query error: {0}")]
    Query(String),
}

impl DbError {
    /// Only transient server errors are eligible for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Transient(_))
    }

    /// The structured server error, if this error is database-shaped.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            DbError::Transient(e) | DbError::Permanent(e) => Some(e),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.server_error().map(|e| e.code.as_str())
    }

    pub fn severity(&self) -> Option<&str> {
        self.server_error().and_then(|e| e.severity.as_deref())
    }
}

/// Splits database-shaped errors into transient and permanent ones based on
/// the configured set of retryable codes.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    retryable: Arc<HashSet<String>>,
}

impl ErrorClassifier {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            retryable: Arc::new(codes.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_retryable_code(&self, code: &str) -> bool {
        self.retryable.contains(code)
    }

    pub fn classify(&self, error: ServerError) -> DbError {
        if self.is_retryable_code(&error.code) {
            DbError::Transient(error)
        } else {
            DbError::Permanent(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_RETRYABLE_CODES;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(DEFAULT_RETRYABLE_CODES.iter().copied())
    }

    #[test]
    fn test_transient_codes_are_retryable() {
        let classifier = classifier();
        for code in ["ECONNREFUSED", "08003", "53300", "57P01", "57P02", "57P03"] {
            let err = classifier.classify(ServerError::new(code, "boom"));
            assert!(err.is_retryable(), "{code} should be retryable");
        }
    }

    #[test]
    fn test_credential_and_catalog_errors_are_permanent() {
        let classifier = classifier();

        let auth = classifier.classify(
            ServerError::new("28P01", "password authentication failed").with_severity("FATAL"),
        );
        assert!(matches!(auth, DbError::Permanent(_)));
        assert!(!auth.is_retryable());
        assert_eq!(auth.severity(), Some("FATAL"));

        let catalog = classifier.classify(ServerError::new("3D000", "database \"x\" does not exist"));
        assert!(!catalog.is_retryable());
        assert_eq!(catalog.code(), Some("3D000"));
    }

    #[test]
    fn test_non_database_errors_are_never_retryable() {
        let query = DbError::Query("unexpected end of stream".to_string());
        assert!(!query.is_retryable());
        assert!(query.server_error().is_none());

        let config = DbError::Configuration("missing url".to_string());
        assert!(!config.is_retryable());
        assert_eq!(config.code(), None);
    }

    #[test]
    fn test_custom_retryable_set() {
        let classifier = ErrorClassifier::new(["28P01"]);
        assert!(classifier.classify(ServerError::new("28P01", "x")).is_retryable());
        assert!(!classifier.classify(ServerError::new("57P01", "x")).is_retryable());
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::new("57P01", "terminating connection").with_severity("FATAL");
        assert_eq!(err.to_string(), "57P01 [FATAL]: terminating connection");
        assert_eq!(ServerError::new("ECONNREFUSED", "refused").to_string(), "ECONNREFUSED: refused");
    }
}
