//! Configuration types.

use std::fmt;
use std::num::NonZeroUsize;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default cap on concurrent retrievals inside one job.
pub const DEFAULT_MAX_DEGREE_OF_PARALLELISM: usize = 3;

/// Default message count from which `ConditionalParallel` goes parallel.
pub const DEFAULT_MINIMUM_MESSAGE_COUNT_TO_PARALLELIZE: usize = 1000;

/// How a job retrieves the messages it enumerated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Always sequential.
    #[default]
    None,
    /// Parallel once the mailbox holds at least
    /// `minimum_message_count_to_parallelize` messages.
    ConditionalParallel,
    /// Always parallel; the minimum count is ignored.
    ForceParallel,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::ConditionalParallel => "conditional_parallel",
            Self::ForceParallel => "force_parallel",
        };
        write!(f, "{s}")
    }
}

/// Fetch policy for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfiguration {
    /// Sequential or parallel retrieval.
    pub execution_mode: ExecutionMode,
    /// Maximum number of retrievals in flight at once. Must be at least 1.
    pub max_degree_of_parallelism: usize,
    /// Message count from which `ConditionalParallel` retrieves in parallel.
    pub minimum_message_count_to_parallelize: usize,
}

impl Default for FetcherConfiguration {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::None,
            max_degree_of_parallelism: DEFAULT_MAX_DEGREE_OF_PARALLELISM,
            minimum_message_count_to_parallelize: DEFAULT_MINIMUM_MESSAGE_COUNT_TO_PARALLELIZE,
        }
    }
}

/// Retrieval strategy chosen for one enumeration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalPlan {
    Sequential,
    Parallel { limit: NonZeroUsize },
}

impl FetcherConfiguration {
    pub fn conditional_parallel(minimum: usize, max_degree: usize) -> Self {
        Self {
            execution_mode: ExecutionMode::ConditionalParallel,
            max_degree_of_parallelism: max_degree,
            minimum_message_count_to_parallelize: minimum,
        }
    }

    pub fn force_parallel(max_degree: usize) -> Self {
        Self {
            execution_mode: ExecutionMode::ForceParallel,
            max_degree_of_parallelism: max_degree,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_degree_of_parallelism == 0 {
            return Err(ConfigError::invalid(
                "max_degree_of_parallelism",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Decide how to retrieve `count` enumerated messages.
    ///
    /// Callers evaluate this once per session, on the count they enumerated;
    /// the mailbox is never re-queried after the branch is chosen.
    pub fn plan(&self, count: usize) -> RetrievalPlan {
        // validate() rejects 0; clamp rather than panic if it was skipped.
        let limit = NonZeroUsize::new(self.max_degree_of_parallelism).unwrap_or(NonZeroUsize::MIN);

        match self.execution_mode {
            ExecutionMode::None => RetrievalPlan::Sequential,
            ExecutionMode::ConditionalParallel
                if count < self.minimum_message_count_to_parallelize =>
            {
                RetrievalPlan::Sequential
            }
            ExecutionMode::ConditionalParallel | ExecutionMode::ForceParallel => {
                RetrievalPlan::Parallel { limit }
            }
        }
    }
}

/// Transport security requested when connecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    /// Let the session pick based on the port.
    #[default]
    Auto,
    /// Implicit TLS.
    Tls,
    /// Plain connection upgraded with STARTTLS/STLS.
    StartTls,
    /// No transport security.
    Plain,
}

/// Mail protocol family of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Imap,
    Pop3,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Imap => "imap",
            Self::Pop3 => "pop3",
        };
        write!(f, "{s}")
    }
}

/// Where and how to log in to a mailbox.
#[derive(Debug, Clone, Deserialize)]
pub struct MailServerConnection {
    pub host: String,
    pub port: u16,
    pub username: String,
    password: SecretString,
    #[serde(default)]
    pub security: Security,
}

impl MailServerConnection {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: SecretString::from(password.into()),
            security: Security::Auto,
        }
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "host".to_string(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("port", "must not be 0"));
        }
        if self.username.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "username".to_string(),
            });
        }
        Ok(())
    }
}
