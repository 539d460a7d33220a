//! Configuration types for a training trial.
//!
//! A trial is described by one YAML file; `repro_core::load_config` merges the
//! file with environment and command-line overrides before it lands here.

use crate::data::Partition;
use repro_core::ConfigError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Complete configuration of one training trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Dataset selection and loader settings.
    pub data: DataConfig,
    /// Model entry point and its free-form parameters.
    pub model: ModelConfig,
    /// Optimizer entry point and optional learning-rate schedule.
    pub optimizer: OptimizerConfig,
    /// Seed for parameter initialization. Required.
    #[serde(default)]
    pub model_seed: Option<u64>,
    /// Seed for data sampling order. Required.
    #[serde(default)]
    pub sampler_seed: Option<u64>,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: u64,
    /// Partitions evaluated at the end of every epoch.
    #[serde(default = "default_error_rates")]
    pub compute_error_rates: Vec<Partition>,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

fn default_max_epochs() -> u64 {
    200
}

fn default_error_rates() -> Vec<Partition> {
    vec![Partition::Train, Partition::Valid]
}

impl ExperimentConfig {
    /// Both seeds, or a descriptive error naming the first missing one.
    pub fn seeds(&self) -> Result<Seeds, ConfigError> {
        let model = self.model_seed.ok_or_else(|| ConfigError::MissingField {
            field: "model_seed".into(),
        })?;
        let sampler = self.sampler_seed.ok_or_else(|| ConfigError::MissingField {
            field: "sampler_seed".into(),
        })?;
        Ok(Seeds { model, sampler })
    }

    /// Stable hash of the merged configuration, used as the default task identity.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&bytes);
        Ok(format!("{digest:x}")[..16].to_string())
    }

    /// Task identity keying the checkpoint store.
    pub fn task_id(&self) -> Result<String, serde_json::Error> {
        match &self.checkpoint.task_id {
            Some(id) => Ok(id.clone()),
            None => self.fingerprint(),
        }
    }
}

/// Model and sampler seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seeds {
    pub model: u64,
    pub sampler: u64,
}

impl Seeds {
    /// Sampler seed used for a given epoch.
    pub fn epoch_seed(&self, epoch: u64) -> u64 {
        self.sampler.wrapping_add(epoch)
    }
}

/// Dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Registered dataset name (`tinyimagenet`).
    pub name: String,
    /// Directory holding the archive and the binary containers.
    pub data_path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Accepted for compatibility with existing trial files; batches are
    /// assembled on the training thread.
    #[serde(default)]
    pub num_workers: usize,
    /// Random crop and horizontal flip on the training partition.
    #[serde(default = "default_true")]
    pub augment: bool,
    /// How long to wait for another job preparing the same dataset.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
    /// Mirror for the dataset archive.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_batch_size() -> usize {
    128
}

fn default_true() -> bool {
    true
}

fn default_lock_timeout() -> u64 {
    10 * 60
}

/// Model entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Remaining keys, forwarded to the model builder untouched.
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Optimizer entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_optimizer")]
    pub name: String,
    pub lr: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub lr_scheduler: Option<SchedulerConfig>,
}

fn default_optimizer() -> String {
    "sgd".to_string()
}

/// Multi-step learning-rate schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Epoch indices at which the rate is multiplied by `gamma`.
    pub milestones: Vec<u64>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Run the first epoch at `lr * gamma` as a warm-up.
    #[serde(default)]
    pub div_first_epoch: bool,
}

fn default_gamma() -> f64 {
    0.1
}

/// Checkpoint store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    /// Minimum time between two checkpoints.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Explicit task identity; defaults to the configuration fingerprint.
    #[serde(default)]
    pub task_id: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            interval_secs: default_interval(),
            task_id: None,
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".repro/checkpoints")
}

fn default_interval() -> u64 {
    5 * 60
}

/// Device requirements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Refuse to start when no GPU is visible.
    #[serde(default)]
    pub require_gpu: bool,
}
