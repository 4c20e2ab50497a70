//! Error types for the xcgi server.

use std::path::PathBuf;

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// IO error.
    #[error("IO error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// xcgi core error.
    #[error("Core error: {0}")]
    Core(#[from] xcgi_core::Error),

    /// Watch error.
    #[error("File watch error: {0}")]
    Watch(String),

    /// TLS setup error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request body could not be parsed.
    #[error("Body error: {0}")]
    Body(String),
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            message: e.to_string(),
        }
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
