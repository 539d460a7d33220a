//! Softmax regression over flattened images.

use super::{Classifier, log_softmax_rows};
use crate::data::Batch;
use crate::error::MlError;
use crate::optim::Optimizer;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LinearState {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

/// `logits = x · W + b` trained with softmax cross-entropy.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    /// `(features, classes)`.
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearClassifier {
    /// Uniform initialization in `±1/sqrt(features)` from a seeded generator.
    pub fn new(features: usize, classes: usize, seed: u64) -> Result<Self, MlError> {
        if features == 0 || classes == 0 {
            return Err(MlError::model(format!(
                "linear model needs positive sizes, got {features}x{classes}"
            )));
        }
        let bound = 1.0 / (features as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let weight = Array2::from_shape_fn((features, classes), |_| rng.gen_range(-bound..bound));
        let bias = Array1::from_shape_fn(classes, |_| rng.gen_range(-bound..bound));
        Ok(Self { weight, bias })
    }

    pub fn features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn classes(&self) -> usize {
        self.weight.ncols()
    }

    fn check_input(&self, images: &Array2<f32>) -> Result<(), MlError> {
        if images.ncols() != self.features() {
            return Err(MlError::model(format!(
                "input has {} features, model expects {}",
                images.ncols(),
                self.features()
            )));
        }
        Ok(())
    }
}

impl Classifier for LinearClassifier {
    fn name(&self) -> &str {
        "linear"
    }

    fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    fn predict(&self, images: &Array2<f32>) -> Result<Array2<f32>, MlError> {
        self.check_input(images)?;
        Ok(images.dot(&self.weight) + &self.bias)
    }

    fn train_step(
        &mut self,
        batch: &Batch,
        optimizer: &mut dyn Optimizer,
    ) -> Result<f64, MlError> {
        if batch.is_empty() {
            return Err(MlError::training("empty training batch"));
        }
        if let Some(&label) = batch.labels.iter().find(|&&l| l >= self.classes()) {
            return Err(MlError::training(format!(
                "label {label} out of range for {} classes",
                self.classes()
            )));
        }

        let n = batch.len() as f32;
        let log_probs = log_softmax_rows(&self.predict(&batch.images)?);

        let mut loss = 0.0f64;
        // d(mean CE)/d(logits) = (softmax - onehot) / n
        let mut grad_logits = log_probs.mapv(f32::exp);
        for (i, &label) in batch.labels.iter().enumerate() {
            loss -= f64::from(log_probs[[i, label]]);
            grad_logits[[i, label]] -= 1.0;
        }
        grad_logits /= n;

        let grad_weight: Vec<f32> = batch.images.t().dot(&grad_logits).iter().copied().collect();
        let grad_bias: Vec<f32> = grad_logits.sum_axis(Axis(0)).to_vec();

        let weight = self
            .weight
            .as_slice_mut()
            .ok_or_else(|| MlError::model("weight is not contiguous"))?;
        optimizer.update("weight", weight, &grad_weight)?;
        let bias = self
            .bias
            .as_slice_mut()
            .ok_or_else(|| MlError::model("bias is not contiguous"))?;
        optimizer.update("bias", bias, &grad_bias)?;

        Ok(loss / batch.len() as f64)
    }

    fn state(&self) -> Result<serde_json::Value, MlError> {
        Ok(serde_json::to_value(LinearState {
            weight: self.weight.clone(),
            bias: self.bias.clone(),
        })?)
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<(), MlError> {
        let state: LinearState = serde_json::from_value(state)?;
        if state.weight.dim() != self.weight.dim() || state.bias.len() != self.bias.len() {
            return Err(MlError::model(format!(
                "saved weights are {:?}, model is {:?}",
                state.weight.dim(),
                self.weight.dim()
            )));
        }
        // Deserialized arrays are in standard layout.
        self.weight = state.weight;
        self.bias = state.bias;
        Ok(())
    }
}
