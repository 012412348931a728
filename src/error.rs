//! Error types for the connection manager.
//!
//! Every failure surfaced by the crate is a [`DbError`]. Messages that come
//! from a backend driver are scrubbed of the configured password before they
//! are stored in a variant, so errors are always safe to log or display.

use crate::models::ManagerState;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Unsupported database driver: {driver}")]
    UnsupportedDriver { driver: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Connection failed: {message}")]
    ConnectFailed { message: String, suggestion: String },

    #[error("Liveness verification failed: {message}")]
    VerifyFailed { message: String },

    #[error("Timed out after {waited:?} waiting for a pooled connection")]
    PoolTimeout { waited: Duration },

    #[error("Connection manager is closed")]
    ManagerClosed,

    #[error("Cannot {operation} while the manager is {state}")]
    InvalidState {
        operation: &'static str,
        state: ManagerState,
    },

    #[error("Execution failed after {elapsed:?} ({arg_count} args) for `{statement}`: {message}")]
    ExecutionFailed {
        statement: String,
        arg_count: usize,
        elapsed: Duration,
        message: String,
        /// Backend-native code, e.g. "42P01" for an undefined table
        sql_state: Option<String>,
    },
}

impl DbError {
    /// Create an unsupported driver error.
    pub fn unsupported_driver(driver: impl Into<String>) -> Self {
        Self::UnsupportedDriver {
            driver: driver.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connect_failed(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConnectFailed {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a verification error.
    pub fn verify_failed(message: impl Into<String>) -> Self {
        Self::VerifyFailed {
            message: message.into(),
        }
    }

    /// Create a pool timeout error.
    pub fn pool_timeout(waited: Duration) -> Self {
        Self::PoolTimeout { waited }
    }

    /// Create a lifecycle misuse error.
    pub fn invalid_state(operation: &'static str, state: ManagerState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Wrap a backend failure with the call context.
    pub fn execution_failed(
        statement: impl Into<String>,
        arg_count: usize,
        elapsed: Duration,
        message: impl Into<String>,
        sql_state: Option<String>,
    ) -> Self {
        Self::ExecutionFailed {
            statement: statement.into(),
            arg_count,
            elapsed,
            message: message.into(),
            sql_state,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectFailed { suggestion, .. } => Some(suggestion),
            Self::UnsupportedDriver { .. } => {
                Some("Use one of: postgres, mysql, sqlite (or their aliases)")
            }
            Self::PoolTimeout { .. } => {
                Some("Raise max_open_conns or the acquire timeout, or release result sets sooner")
            }
            _ => None,
        }
    }

    /// Backend-native error code of an execution failure.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::ExecutionFailed { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Execution failures are not classified here; inspect [`DbError::sql_state`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. } | Self::PoolTimeout { .. })
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Failure reported by a backend connection.
///
/// `broken` marks failures after which the physical connection must not be
/// handed out again (transport, TLS or protocol errors).
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub sql_state: Option<String>,
    pub broken: bool,
}

impl BackendError {
    /// A statement-level failure; the connection stays usable.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
            broken: false,
        }
    }

    /// A failure that leaves the connection unusable.
    pub fn broken(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
            broken: true,
        }
    }

    pub fn with_sql_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }
}

/// Convert sqlx errors to BackendError.
impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => {
                BackendError::new(format!("Configuration error: {}", msg))
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                BackendError {
                    message: db_err.message().to_string(),
                    sql_state: code,
                    broken: false,
                }
            }
            sqlx::Error::RowNotFound => BackendError::new("No rows returned"),
            sqlx::Error::Io(io_err) => BackendError::broken(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => BackendError::broken(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => BackendError::broken(format!("Protocol error: {}", msg)),
            sqlx::Error::TypeNotFound { type_name } => {
                BackendError::new(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                BackendError::new(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => BackendError::new(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                BackendError::new(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => BackendError::new(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => BackendError::broken("Database worker crashed"),
            _ => BackendError::new(format!("Unknown database error: {}", err)),
        }
    }
}
