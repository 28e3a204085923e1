//! Error types for the guard layer.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryError;

/// Result type for calls made through a circuit breaker.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Error type for circuit breaker calls.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was never attempted.
    Open(CircuitOpenError),

    /// The underlying operation ran and failed.
    Operation(E),
}

impl<E> BreakerError<E> {
    /// Whether the breaker short-circuited the call.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }

    /// The operation error, if the operation actually ran.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            BreakerError::Open(_) => None,
        }
    }
}

impl<E> Display for BreakerError<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open(e) => write!(f, "{}", e),
            BreakerError::Operation(e) => write!(f, "Operation error: {}", e),
        }
    }
}

impl<E: StdError + 'static> StdError for BreakerError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            BreakerError::Open(e) => Some(e),
            BreakerError::Operation(e) => Some(e),
        }
    }
}

impl BreakerError<RetryError<UpstreamError>> {
    /// Status code a proxy should answer with for this failure.
    ///
    /// Short-circuits and exhausted retries surface as 503; client errors
    /// from the backend are passed through unchanged.
    pub fn response_status(&self) -> u16 {
        match self {
            BreakerError::Open(_) => 503,
            BreakerError::Operation(e) => e.error().response_status(),
        }
    }
}

/// Rejection produced when a breaker refuses to run an operation.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker '{name}' is open; retry in {retry_after:?}")]
pub struct CircuitOpenError {
    /// Name of the breaker that rejected the call.
    pub name: String,
    /// Remaining cool-down before a trial call may be admitted. While a trial
    /// call is already running this is the full open duration.
    pub retry_after: Duration,
}

/// Category of a connection-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// The backend refused the connection.
    Refused,
    /// The connection was reset or dropped mid-exchange.
    Reset,
    /// The backend host name did not resolve.
    Dns,
    /// The request did not complete in time.
    Timeout,
    /// Any other transport failure.
    Other,
}

impl Display for NetworkErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkErrorKind::Refused => "connection refused",
            NetworkErrorKind::Reset => "connection reset",
            NetworkErrorKind::Dns => "dns failure",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Other => "transport error",
        })
    }
}

/// Failure returned by one of the protected HTTP backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// Connection refused/reset, DNS failure or timeout.
    #[error("{kind}: {message}")]
    TransientNetwork {
        /// What went wrong at the transport level.
        kind: NetworkErrorKind,
        /// Detail from the underlying error.
        message: String,
    },

    /// HTTP 5xx or 429.
    #[error("upstream server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// Any 4xx other than 429.
    #[error("upstream client error {status}: {message}")]
    Client {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// A status outside 4xx and 5xx reported as a failure, such as an
    /// unfollowed redirect or a code no HTTP version defines. Not retried.
    #[error("unexpected upstream status {status}: {message}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },
}

impl UpstreamError {
    /// Classifies a failing HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 | 500..=599 => UpstreamError::Server { status, message },
            400..=499 => UpstreamError::Client { status, message },
            _ => UpstreamError::UnexpectedStatus { status, message },
        }
    }

    /// Builds a transport-level failure.
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        UpstreamError::TransientNetwork {
            kind,
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::TransientNetwork { .. } => None,
            UpstreamError::Server { status, .. }
            | UpstreamError::Client { status, .. }
            | UpstreamError::UnexpectedStatus { status, .. } => Some(*status),
        }
    }

    /// Status code a proxy should answer with when this error is final.
    pub fn response_status(&self) -> u16 {
        match self {
            UpstreamError::Client { status, .. } => *status,
            UpstreamError::TransientNetwork { .. } | UpstreamError::Server { .. } => 503,
            UpstreamError::UnexpectedStatus { .. } => 502,
        }
    }
}

impl From<io::Error> for UpstreamError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => NetworkErrorKind::Refused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => NetworkErrorKind::Reset,
            io::ErrorKind::TimedOut => NetworkErrorKind::Timeout,
            _ if looks_like_dns(&err.to_string()) => NetworkErrorKind::Dns,
            _ => NetworkErrorKind::Other,
        };
        UpstreamError::network(kind, err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for UpstreamError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        UpstreamError::network(NetworkErrorKind::Timeout, err.to_string())
    }
}

#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return UpstreamError::from_status(status.as_u16(), err.to_string());
        }

        let mut detail = err.to_string();
        let mut source = err.source();
        while let Some(inner) = source {
            detail.push_str(": ");
            detail.push_str(&inner.to_string());
            source = inner.source();
        }

        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if looks_like_dns(&detail) {
            NetworkErrorKind::Dns
        } else if err.is_connect() {
            NetworkErrorKind::Refused
        } else {
            NetworkErrorKind::Other
        };
        UpstreamError::network(kind, detail)
    }
}

fn looks_like_dns(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("dns")
        || message.contains("failed to lookup address")
        || message.contains("name or service not known")
}

/// Errors raised while building breakers or loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting has an unusable value.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending setting.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A breaker with this name is already registered.
    #[error("circuit breaker '{0}' is already registered")]
    DuplicateBreaker(String),

    /// The settings file could not be read.
    #[error("failed to read settings: {0}")]
    Io(#[from] io::Error),

    /// The settings file is not valid TOML for this schema.
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
