//! Error types for plughost
//!
//! This module defines the crate-wide error type. Uses `thiserror` for
//! ergonomic error handling with automatic `Display` and `Error` trait
//! implementations. Errors raised by plugin code itself (constructors and
//! callable methods) are `anyhow::Error` and never wrapped here.

use thiserror::Error;

use crate::store::StoreError;

/// The primary error type for plughost operations.
#[derive(Error, Debug)]
pub enum HostError {
    /// Configuration-related errors (invalid config, unreadable config file, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Plugin manifest errors (missing file, invalid names, bad task declarations)
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Discovery errors (unresolvable entry factory, unreadable plugin root)
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Host application errors (module repopulation rejected, unknown module)
    #[error("Host error: {0}")]
    Host(String),

    /// Plugin file install step failures
    #[error("Install error: {0}")]
    Install(String),

    /// Persisted record or schedule store failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Resource not found (plugins, records, modules)
    #[error("Not found: {0}")]
    NotFound(String),
}

/// A specialized `Result` type for plughost operations.
pub type Result<T> = std::result::Result<T, HostError>;
