//! Multi-step learning-rate schedule.

use crate::config::SchedulerConfig;
use crate::error::MlError;
use serde::{Deserialize, Serialize};

/// Step schedule over fixed epoch milestones.
///
/// The rate for 0-based epoch `e` is `base * gamma^k`, where `k` is the number
/// of milestones `<= e`. With `div_first_epoch`, epoch 0 runs at `base * gamma`
/// as a warm-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<u64>,
    gamma: f64,
    div_first_epoch: bool,
    /// Last epoch a rate was produced for.
    last_epoch: Option<u64>,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, mut milestones: Vec<u64>, gamma: f64) -> Result<Self, MlError> {
        if !(gamma > 0.0 && gamma.is_finite()) {
            return Err(MlError::invalid_input(format!(
                "schedule gamma must be positive, got {gamma}"
            )));
        }
        milestones.sort_unstable();
        Ok(Self {
            base_lr,
            milestones,
            gamma,
            div_first_epoch: false,
            last_epoch: None,
        })
    }

    pub fn from_config(base_lr: f64, config: &SchedulerConfig) -> Result<Self, MlError> {
        Ok(Self::new(base_lr, config.milestones.clone(), config.gamma)?
            .with_div_first_epoch(config.div_first_epoch))
    }

    pub fn with_div_first_epoch(mut self, enabled: bool) -> Self {
        self.div_first_epoch = enabled;
        self
    }

    /// Number of milestones already passed at `epoch` (bisect-right).
    pub fn steps_at(&self, epoch: u64) -> usize {
        self.milestones.partition_point(|&m| m <= epoch)
    }

    /// Learning rate for 0-based `epoch`.
    pub fn rate(&self, epoch: u64) -> f64 {
        if self.div_first_epoch && epoch < 1 {
            return self.base_lr * self.gamma;
        }
        self.base_lr * self.gamma.powi(self.steps_at(epoch) as i32)
    }

    /// Advance to `epoch` and return its rate.
    pub fn step(&mut self, epoch: u64) -> f64 {
        self.last_epoch = Some(epoch);
        self.rate(epoch)
    }

    pub fn last_epoch(&self) -> Option<u64> {
        self.last_epoch
    }

    pub fn milestones(&self) -> &[u64] {
        &self.milestones
    }
}
