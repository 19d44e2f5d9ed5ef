//! Centralized error handling for the reproxy application
//!
//! This module provides a unified error system across all application layers.
//!
//! # Error Categories
//!
//! - **Configuration Errors**: unparseable rules, invalid regexes, bad TLS material
//! - **Provider Errors**: discovery source connectivity and parsing failures
//! - **Proxy Errors**: request routing and upstream dispatch failures
//! - **Plugin Errors**: conductor registration and RPC invocation failures

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for Provider Results
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Convenience type alias for Plugin Results
pub type PluginResult<T> = Result<T, PluginError>;
