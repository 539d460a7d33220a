//! Assembly of a training run from its configuration.

use crate::config::{ExperimentConfig, Seeds};
use crate::data::{Partitions, build_dataset};
use crate::error::MlError;
use crate::model::{Classifier, build_model};
use crate::optim::{MultiStepLr, Optimizer, build_optimizer, build_scheduler};
use crate::training::callbacks::NonFiniteLossCallback;
use crate::training::checkpoint::CheckpointStore;
use crate::training::reproducibility::{Device, EnvironmentSnapshot, detect_gpu, ensure_device};
use crate::training::trainer::{Trainer, TrainerSettings};
use tracing::info;

/// Components built from an [`ExperimentConfig`], ready to train.
pub struct Experiment {
    pub data: Partitions,
    pub model: Box<dyn Classifier>,
    pub optimizer: Box<dyn Optimizer>,
    pub scheduler: Option<MultiStepLr>,
    pub device: Device,
    pub seeds: Seeds,
}

impl Experiment {
    /// Wire the components into a trainer checkpointing to `store`.
    pub fn into_trainer(self, config: &ExperimentConfig, store: Box<dyn CheckpointStore>) -> Trainer {
        let settings = TrainerSettings::from_config(config, self.seeds);
        Trainer::new(self.model, self.optimizer, self.data, store, settings)
            .with_scheduler(self.scheduler)
            .with_callback(NonFiniteLossCallback)
    }
}

/// Validate seeds and device, then build dataset, model, optimizer and schedule.
///
/// Seeds and the device are checked before the dataset is touched so that a
/// misconfigured job fails without downloading anything.
pub async fn build_experiment(config: &ExperimentConfig) -> Result<Experiment, MlError> {
    let seeds = config.seeds()?;
    let device = ensure_device(&config.device, detect_gpu())?;

    let snapshot = EnvironmentSnapshot::capture(device);
    info!(
        ?device,
        platform = %snapshot.platform,
        arch = %snapshot.arch,
        version = %snapshot.version,
        "Environment"
    );
    info!(config = %serde_json::to_string(config)?, "Configuration");

    let data = build_dataset(&config.data).await?;
    let model = build_model(&config.model, data.input, data.num_classes, seeds.model)?;
    let optimizer = build_optimizer(&config.optimizer)?;
    let scheduler = build_scheduler(&config.optimizer)?;
    info!(
        optimizer = optimizer.name(),
        lr = optimizer.learning_rate(),
        momentum = config.optimizer.momentum,
        weight_decay = config.optimizer.weight_decay,
        milestones = ?scheduler.as_ref().map(|s| s.milestones().to_vec()),
        "Optimizer"
    );

    Ok(Experiment {
        data,
        model,
        optimizer,
        scheduler,
        device,
        seeds,
    })
}
