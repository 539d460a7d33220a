//! Per-epoch evaluation statistics.

use crate::data::Partition;
use crate::error::MlError;
use crate::model::{argmax_rows, log_softmax_rows};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mean loss and error rate over one partition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub loss: f64,
    pub error_rate: f64,
}

/// Statistics recorded at the end of an epoch. Serializes flat, e.g.
/// `{"epoch": 3, "train": {...}, "valid": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: u64,
    #[serde(flatten)]
    pub partitions: BTreeMap<Partition, PartitionStats>,
}

impl EpochStats {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            partitions: BTreeMap::new(),
        }
    }

    pub fn get(&self, partition: Partition) -> Option<&PartitionStats> {
        self.partitions.get(&partition)
    }
}

/// Final result of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub last: EpochStats,
    pub all: Vec<EpochStats>,
}

/// Accumulates cross-entropy and misclassifications over batches.
#[derive(Debug, Clone, Default)]
pub struct EvalAccumulator {
    loss_sum: f64,
    errors: usize,
    count: usize,
}

impl EvalAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch of class scores and the true labels.
    pub fn add(&mut self, scores: &Array2<f32>, labels: &[usize]) -> Result<(), MlError> {
        if scores.nrows() != labels.len() {
            return Err(MlError::training(format!(
                "{} predictions for {} labels",
                scores.nrows(),
                labels.len()
            )));
        }
        let log_probs = log_softmax_rows(scores);
        for ((i, &label), predicted) in labels.iter().enumerate().zip(argmax_rows(scores)) {
            if label >= scores.ncols() {
                return Err(MlError::training(format!(
                    "label {label} out of range for {} classes",
                    scores.ncols()
                )));
            }
            self.loss_sum -= f64::from(log_probs[[i, label]]);
            if predicted != label {
                self.errors += 1;
            }
        }
        self.count += labels.len();
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn finish(&self) -> Result<PartitionStats, MlError> {
        if self.count == 0 {
            return Err(MlError::training("cannot evaluate an empty partition"));
        }
        let n = self.count as f64;
        Ok(PartitionStats {
            loss: self.loss_sum / n,
            error_rate: self.errors as f64 / n,
        })
    }
}
