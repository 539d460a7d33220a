//! Optimizers and learning-rate schedules.

pub mod scheduler;

pub use scheduler::MultiStepLr;

use crate::config::OptimizerConfig;
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameter update rule. Parameters are addressed by name so that state
/// (momentum buffers) can be saved and restored with a checkpoint.
pub trait Optimizer: Send {
    fn name(&self) -> &str;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Apply one update to `param` given its gradient.
    fn update(&mut self, name: &str, param: &mut [f32], grad: &[f32]) -> Result<(), MlError>;

    fn state(&self) -> Result<serde_json::Value, MlError>;

    fn load_state(&mut self, state: serde_json::Value) -> Result<(), MlError>;
}

/// Stochastic gradient descent with momentum and L2 weight decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    buffers: BTreeMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64, weight_decay: f64) -> Result<Self, MlError> {
        if lr < 0.0 || momentum < 0.0 || weight_decay < 0.0 {
            return Err(MlError::invalid_input(format!(
                "sgd needs non-negative lr/momentum/weight_decay, got {lr}/{momentum}/{weight_decay}"
            )));
        }
        Ok(Self {
            lr,
            momentum,
            weight_decay,
            buffers: BTreeMap::new(),
        })
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn update(&mut self, name: &str, param: &mut [f32], grad: &[f32]) -> Result<(), MlError> {
        if param.len() != grad.len() {
            return Err(MlError::training(format!(
                "gradient for '{name}' has {} values, parameter has {}",
                grad.len(),
                param.len()
            )));
        }

        let lr = self.lr as f32;
        let wd = self.weight_decay as f32;
        let momentum = self.momentum as f32;

        if momentum == 0.0 {
            for (p, &g) in param.iter_mut().zip(grad) {
                *p -= lr * (g + wd * *p);
            }
            return Ok(());
        }

        match self.buffers.get_mut(name) {
            Some(buf) if buf.len() == param.len() => {
                for ((p, &g), b) in param.iter_mut().zip(grad).zip(buf.iter_mut()) {
                    *b = momentum * *b + g + wd * *p;
                    *p -= lr * *b;
                }
            }
            _ => {
                // First step: the buffer starts at the raw gradient.
                let mut buf = Vec::with_capacity(param.len());
                for (p, &g) in param.iter_mut().zip(grad) {
                    let d = g + wd * *p;
                    buf.push(d);
                    *p -= lr * d;
                }
                self.buffers.insert(name.to_string(), buf);
            }
        }
        Ok(())
    }

    fn state(&self) -> Result<serde_json::Value, MlError> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<(), MlError> {
        *self = serde_json::from_value(state)?;
        Ok(())
    }
}

/// Build the optimizer named in `config`.
pub fn build_optimizer(config: &OptimizerConfig) -> Result<Box<dyn Optimizer>, MlError> {
    match config.name.as_str() {
        "sgd" => Ok(Box::new(Sgd::new(
            config.lr,
            config.momentum,
            config.weight_decay,
        )?)),
        other => Err(MlError::invalid_input(format!("unknown optimizer '{other}'"))),
    }
}

/// Build the schedule configured under `optimizer.lr_scheduler`, if any.
pub fn build_scheduler(config: &OptimizerConfig) -> Result<Option<MultiStepLr>, MlError> {
    config
        .lr_scheduler
        .as_ref()
        .map(|s| MultiStepLr::from_config(config.lr, s))
        .transpose()
}
