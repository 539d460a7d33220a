//! Training driver: lifecycle loop, metrics, checkpoints, callbacks.

pub mod callbacks;
pub mod checkpoint;
pub mod experiment;
pub mod metrics;
pub mod reproducibility;
pub mod trainer;

pub use callbacks::{CallbackAction, NonFiniteLossCallback, TrainingCallback};
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use experiment::{Experiment, build_experiment};
pub use metrics::{EpochStats, PartitionStats, TrainingReport};
pub use reproducibility::Device;
pub use trainer::{Clock, EngineState, SystemClock, Trainer, TrainerSettings};
