//! # Repro Core
//!
//! Shared building blocks for the repro experiment harness: layered YAML
//! configuration with dotted command-line overrides, atomic JSON persistence,
//! and a cross-process advisory file lock with a bounded wait.

pub mod config;
pub mod error;
pub mod lock;
pub mod persistence;

pub use config::{Update, load_config};
pub use error::{ConfigError, LockError};
pub use lock::FileLock;
