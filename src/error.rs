//! Error types for mail-fetch.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Top-level error for a fetch job.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Connection to {host} failed: {source}")]
    Connection {
        host: String,
        #[source]
        source: SessionError,
    },

    #[error("Protocol error during {operation}: {source}")]
    Protocol {
        operation: &'static str,
        #[source]
        source: SessionError,
    },

    #[error("Fetch cancelled")]
    Cancelled,

    #[error("Hook {hook} failed: {reason}")]
    Hook { hook: &'static str, reason: String },

    #[error("Fetch task panicked: {reason}")]
    Panicked { reason: String },

    #[error("Fetch job could not be scheduled: {reason}")]
    Scheduling { reason: String },
}

impl FetchError {
    pub fn connection(host: impl Into<String>, source: SessionError) -> Self {
        Self::Connection {
            host: host.into(),
            source,
        }
    }

    pub fn protocol(operation: &'static str, source: SessionError) -> Self {
        Self::Protocol { operation, source }
    }

    pub fn hook(hook: &'static str, reason: impl Into<String>) -> Self {
        Self::Hook {
            hook,
            reason: reason.into(),
        }
    }

    /// Coarse classification, stable across error payloads.
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Usage(_) => FetchErrorKind::Usage,
            Self::Connection { .. } => FetchErrorKind::Connection,
            Self::Protocol { .. } => FetchErrorKind::Protocol,
            Self::Cancelled => FetchErrorKind::Cancelled,
            Self::Hook { .. } => FetchErrorKind::Hook,
            Self::Panicked { .. } => FetchErrorKind::Panicked,
            Self::Scheduling { .. } => FetchErrorKind::Scheduling,
        }
    }

    /// True when the shared cancellation signal ended the fetch.
    ///
    /// Callers treat this as an expected shutdown rather than a malfunction.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Kind of a [`FetchError`], used in reports and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Usage,
    Connection,
    Protocol,
    Cancelled,
    Hook,
    Panicked,
    Scheduling,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Usage => "usage",
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Cancelled => "cancelled",
            Self::Hook => "hook",
            Self::Panicked => "panicked",
            Self::Scheduling => "scheduling",
        };
        write!(f, "{s}")
    }
}

/// Misuse of the fetch API, detected before any network activity.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("Mail server connection is not configured")]
    MissingConnection,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Fetcher for {protocol} does not accept a selection criterion")]
    NotConfigurable { protocol: String },

    #[error("No fetcher registered for protocol {protocol}")]
    UnsupportedProtocol { protocol: String },

    #[error("Service parallelism must be at least 1")]
    ZeroParallelism,
}

/// Errors reported by a mail session implementation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Server replied with an error: {0}")]
    Protocol(String),

    #[error("Message {0} not found")]
    NotFound(String),

    #[error("Session is not connected")]
    Closed,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

impl From<ConfigError> for FetchError {
    fn from(err: ConfigError) -> Self {
        Self::Usage(UsageError::InvalidConfig(err))
    }
}

/// Result type alias for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;
