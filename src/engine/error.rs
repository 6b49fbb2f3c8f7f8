//! Portable error taxonomy
//!
//! Every failure that leaves an adapter is a [`DataSourceError`]. Raw driver
//! errors are turned into one by [`classify`], which looks at the lower-cased
//! message and assigns exactly one [`ErrorKind`].

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::DataSourceType;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Error kinds with fixed retryability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ConnectionPoolError,
    ConnectionAcquisitionTimeout,
    ConnectionPoolExhausted,
    QueryExecutionError,
    QueryTimeout,
    AuthenticationError,
    NetworkError,
    ConfigurationError,
}

impl ErrorKind {
    pub const fn is_retryable(self) -> bool {
        match self {
            ErrorKind::ConnectionPoolError
            | ErrorKind::ConnectionAcquisitionTimeout
            | ErrorKind::ConnectionPoolExhausted
            | ErrorKind::QueryTimeout
            | ErrorKind::NetworkError => true,
            ErrorKind::QueryExecutionError
            | ErrorKind::AuthenticationError
            | ErrorKind::ConfigurationError => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionPoolError => "ConnectionPoolError",
            ErrorKind::ConnectionAcquisitionTimeout => "ConnectionAcquisitionTimeout",
            ErrorKind::ConnectionPoolExhausted => "ConnectionPoolExhausted",
            ErrorKind::QueryExecutionError => "QueryExecutionError",
            ErrorKind::QueryTimeout => "QueryTimeout",
            ErrorKind::AuthenticationError => "AuthenticationError",
            ErrorKind::NetworkError => "NetworkError",
            ErrorKind::ConfigurationError => "ConfigurationError",
        }
    }

    /// The sentence shown to end users for this kind.
    pub const fn user_message(self) -> &'static str {
        match self {
            ErrorKind::ConnectionPoolError => {
                "The data source connection pool ran into a problem. Please try again."
            }
            ErrorKind::ConnectionAcquisitionTimeout => {
                "All connections to the data source are busy. Please try again in a moment."
            }
            ErrorKind::ConnectionPoolExhausted => {
                "The data source has reached its connection limit. Please try again shortly."
            }
            ErrorKind::QueryExecutionError => {
                "The query could not be executed. Please check the query and try again."
            }
            ErrorKind::QueryTimeout => {
                "The query took too long to complete and was stopped. Try narrowing the query."
            }
            ErrorKind::AuthenticationError => {
                "Unable to authenticate with the data source. Please verify the credentials."
            }
            ErrorKind::NetworkError => {
                "Unable to reach the data source. Please check network connectivity."
            }
            ErrorKind::ConfigurationError => {
                "The data source is not configured correctly. Please review its settings."
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only error type callers of an adapter observe.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct DataSourceError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl DataSourceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: ErrorKind, message: impl Into<String>, source: BoxError) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn original_cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationError, message)
    }

    pub fn query_timeout(timeout_ms: u64) -> Self {
        Self::new(
            ErrorKind::QueryTimeout,
            format!("Query timed out after {timeout_ms}ms"),
        )
    }

    pub fn acquisition_timeout(timeout_ms: u128) -> Self {
        Self::new(
            ErrorKind::ConnectionAcquisitionTimeout,
            format!("Timed out after {timeout_ms}ms waiting to acquire a pooled connection"),
        )
    }

    pub fn pool_closed() -> Self {
        Self::new(ErrorKind::ConnectionPoolError, "Connection pool is closed")
    }

    pub fn not_connected(data_source: DataSourceType) -> Self {
        Self::configuration(format!(
            "{} adapter is not connected. Call initialize() first.",
            data_source.display_name()
        ))
    }

    pub fn invalid_credentials_type(expected: DataSourceType, actual: DataSourceType) -> Self {
        Self::configuration(format!(
            "Invalid credentials type. Expected {expected}, got {actual}"
        ))
    }
}

pub type EngineResult<T> = Result<T, DataSourceError>;

/// Where a raw error came from; prefixed to the internal message only.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    pub data_source: DataSourceType,
    pub operation: &'a str,
}

impl<'a> ErrorContext<'a> {
    pub fn new(data_source: DataSourceType, operation: &'a str) -> Self {
        Self {
            data_source,
            operation,
        }
    }
}

/// Ordered decision table; the first row with a matching needle wins.
const CLASSIFICATION_RULES: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::ConnectionPoolExhausted, &["exhausted"]),
    (
        ErrorKind::ConnectionAcquisitionTimeout,
        &["acquire", "acquisition"],
    ),
    (ErrorKind::ConnectionPoolError, &["pool"]),
    (ErrorKind::QueryTimeout, &["timeout", "timed out"]),
    (
        ErrorKind::AuthenticationError,
        &["auth", "credential", "access denied", "login failed"],
    ),
    (
        ErrorKind::NetworkError,
        &["refused", "reset", "unreachable", "enotfound", "network"],
    ),
    (
        ErrorKind::ConfigurationError,
        &["configuration", "invalid", "not found"],
    ),
];

/// Picks the kind for a raw error message. Total: anything unmatched,
/// including the empty message, is a `QueryExecutionError`.
pub fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();
    CLASSIFICATION_RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::QueryExecutionError)
}

/// Classifies a raw driver error, keeping it as the original cause.
pub fn classify<E>(raw: E, context: Option<ErrorContext<'_>>) -> DataSourceError
where
    E: Into<BoxError>,
{
    let raw: BoxError = raw.into();
    let text = raw.to_string();
    let kind = classify_message(&text);
    let message = match context {
        Some(ctx) => format!("[{} {}] {}", ctx.data_source, ctx.operation, text),
        None => text,
    };
    DataSourceError::with_source(kind, message, raw)
}

/// One fixed sentence per kind; raw driver text never reaches the user.
pub fn format_for_user(error: &DataSourceError) -> &'static str {
    error.kind().user_message()
}

/// Classifies the error side of a driver result at the adapter boundary.
pub trait ClassifyExt<T> {
    fn classify_err(self, context: ErrorContext<'_>) -> EngineResult<T>;
}

impl<T, E> ClassifyExt<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn classify_err(self, context: ErrorContext<'_>) -> EngineResult<T> {
        self.map_err(|err| classify(err, Some(context)))
    }
}
