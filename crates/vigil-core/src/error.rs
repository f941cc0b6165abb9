use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Errors that can occur across the Vigil platform.
///
/// Each variant wraps a specific error domain. Library crates use this type
/// directly; the binary crate converts to a `miette` diagnostic at the boundary.
///
/// # Examples
///
/// ```
/// use vigil_core::{ErrorCategory, VigilError};
///
/// let err = VigilError::Http { status: 503, message: "unavailable".into() };
/// assert_eq!(err.category(), ErrorCategory::ServerError);
/// assert!(err.is_transient());
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum VigilError {
    /// The remote end could not be reached (refused, reset, DNS).
    #[error("connection error: {0}")]
    Connection(String),

    /// A call did not complete within its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A remote service answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code returned by the service.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The circuit breaker for a dependency rejected the call.
    #[error("circuit breaker open for {dependency}")]
    CircuitOpen {
        /// Name of the guarded dependency.
        dependency: String,
    },

    /// A degradable feature is unhealthy and has no substitute.
    #[error("feature {feature} is unavailable and has no degraded mode")]
    FeatureUnavailable {
        /// Name of the feature.
        feature: String,
    },

    /// Input that cannot be processed (bad diff, bad reference, bad response).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An analyzer, generator, or source collaborator failed.
    #[error("{component} failed: {message}")]
    Collaborator {
        /// Collaborator that raised the error.
        component: String,
        /// Failure description.
        message: String,
    },

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl VigilError {
    /// Shorthand for a [`VigilError::Collaborator`] failure.
    pub fn collaborator(component: impl Into<String>, message: impl Into<String>) -> Self {
        VigilError::Collaborator {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Classify this error for retry, breaker, and recovery decisions.
    ///
    /// # Examples
    ///
    /// ```
    /// use vigil_core::{ErrorCategory, VigilError};
    ///
    /// let err = VigilError::Http { status: 429, message: "slow down".into() };
    /// assert_eq!(err.category(), ErrorCategory::RateLimited);
    ///
    /// let err = VigilError::Http { status: 404, message: "gone".into() };
    /// assert_eq!(err.category(), ErrorCategory::ClientError);
    /// ```
    pub fn category(&self) -> ErrorCategory {
        match self {
            VigilError::Connection(_) => ErrorCategory::Connection,
            VigilError::Timeout(_) => ErrorCategory::Timeout,
            VigilError::Http { status, .. } => match status {
                429 => ErrorCategory::RateLimited,
                500..=599 => ErrorCategory::ServerError,
                _ => ErrorCategory::ClientError,
            },
            VigilError::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            VigilError::FeatureUnavailable { .. } => ErrorCategory::Unavailable,
            VigilError::InvalidInput(_)
            | VigilError::Serialization(_)
            | VigilError::Toml(_) => ErrorCategory::InvalidInput,
            VigilError::Collaborator { .. }
            | VigilError::Config(_)
            | VigilError::Io(_)
            | VigilError::FileNotFound(_) => ErrorCategory::Internal,
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            VigilError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` for transport-level failures that may succeed on retry.
    ///
    /// Transient errors are the only ones counted by circuit breakers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connection
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
        )
    }
}

/// Coarse classification of a [`VigilError`].
///
/// # Examples
///
/// ```
/// use vigil_core::ErrorCategory;
///
/// let c: ErrorCategory = "rate_limited".parse().unwrap();
/// assert_eq!(c, ErrorCategory::RateLimited);
/// assert_eq!(c.to_string(), "rate_limited");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection refused, reset, or unresolvable host.
    Connection,
    /// Deadline exceeded.
    Timeout,
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    ServerError,
    /// HTTP 4xx other than 429.
    ClientError,
    /// Call rejected by an open circuit breaker.
    CircuitOpen,
    /// Degraded feature without substitute.
    Unavailable,
    /// Malformed input or response.
    InvalidInput,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Connection => "connection",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "connection" => Ok(ErrorCategory::Connection),
            "timeout" => Ok(ErrorCategory::Timeout),
            "rate_limited" => Ok(ErrorCategory::RateLimited),
            "server_error" => Ok(ErrorCategory::ServerError),
            "client_error" => Ok(ErrorCategory::ClientError),
            "circuit_open" => Ok(ErrorCategory::CircuitOpen),
            "unavailable" => Ok(ErrorCategory::Unavailable),
            "invalid_input" => Ok(ErrorCategory::InvalidInput),
            "internal" => Ok(ErrorCategory::Internal),
            other => Err(format!("unknown error category: {other}")),
        }
    }
}
