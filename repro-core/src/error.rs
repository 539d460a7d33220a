//! Error types for the repro core library.

use std::path::PathBuf;

/// Errors raised while loading or merging configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid update '{argument}': {message}")]
    InvalidUpdate { argument: String, message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration parse error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

/// Errors from the cross-process file lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock {path} still held by another process after {timeout_secs}s")]
    TimedOut { path: PathBuf, timeout_secs: u64 },

    #[error("Lock IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LockError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}
