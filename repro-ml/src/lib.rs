//! # Repro ML
//!
//! Dataset preparation and loading, a reference classifier, SGD with a
//! multi-step schedule, and a resumable training driver that checkpoints into
//! a task-keyed store.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod optim;
pub mod training;

pub use config::{ExperimentConfig, Seeds};
pub use error::MlError;
pub use training::{TrainingReport, build_experiment};
