//! Error types for millbridge.

use std::io;
use thiserror::Error;

/// Result type for millbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for millbridge operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// XMODEM transfer error.
    #[error("XMODEM error: {0}")]
    Xmodem(String),

    /// Command catalog error.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Virtual file store error.
    #[error("File store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON parse error in a catalog or file-store document.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
