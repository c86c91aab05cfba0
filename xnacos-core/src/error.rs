//! Error types for the naming client

use thiserror::Error;

/// Naming client error types
///
/// Every variant carries plain strings so the error can be cloned and handed
/// to every caller waiting on the same registry fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Registry unreachable: {0}")]
    Unreachable(String),

    #[error("No instance available for service {0}")]
    NoInstance(String),

    #[error("No healthy instance available for service {0}")]
    NoHealthyInstance(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Client is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether the failure is worth retrying with backoff
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for naming client operations
pub type Result<T> = std::result::Result<T, Error>;
