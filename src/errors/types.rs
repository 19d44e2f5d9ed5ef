//! Error type definitions for the reproxy application
//!
//! All error types used throughout the application live here, providing a
//! hierarchical error system that makes debugging and error handling
//! straightforward.

use thiserror::Error;

/// Top-level application error type
///
/// This enum represents all possible errors that can occur in the application.
/// It uses `thiserror` to provide automatic error trait implementations and
/// proper error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// Discovery provider errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Plugin conductor errors
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// TLS material or ACME order errors
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem and socket errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Discovery provider specific errors
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Provider backend not reachable
    #[error("Connection failed: {provider} - {message}")]
    ConnectionFailed { provider: String, message: String },

    /// Rule definition could not be parsed
    #[error("Invalid rule: {rule} - {message}")]
    InvalidRule { rule: String, message: String },

    /// Source pattern failed to compile
    #[error("Invalid source pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Rules file could not be read or parsed
    #[error("Rules file error: {path} - {message}")]
    File { path: String, message: String },

    /// HTTP errors from catalog or runtime APIs
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Container runtime API errors
    #[error("Container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Filesystem errors while watching sources
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Plugin conductor specific errors
#[derive(Error, Debug)]
pub enum PluginError {
    /// Plugin endpoint could not be dialed at registration
    #[error("Dial failed: {address} - {message}")]
    DialFailed { address: String, message: String },

    /// RPC transport failure during an invocation
    #[error("RPC transport error: {method} - {message}")]
    Transport { method: String, message: String },

    /// Plugin replied with an RPC-level error
    #[error("RPC error from {method}: {message}")]
    Rpc { method: String, message: String },

    /// Malformed registration payload
    #[error("Invalid registration: {message}")]
    InvalidRegistration { message: String },
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Create a connection-failed error for a named provider
    pub fn connection<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::ConnectionFailed {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-rule error
    pub fn invalid_rule<R: Into<String>, M: Into<String>>(rule: R, message: M) -> Self {
        Self::InvalidRule {
            rule: rule.into(),
            message: message.into(),
        }
    }
}
