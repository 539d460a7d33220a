//! Classifier abstraction and the built-in models.

pub mod linear;

pub use linear::LinearClassifier;

use crate::config::ModelConfig;
use crate::data::{Batch, ImageShape};
use crate::error::MlError;
use crate::optim::Optimizer;
use ndarray::{Array2, Axis};
use tracing::{info, warn};

/// A trainable image classifier.
///
/// Inputs are the flattened, normalized batches produced by the data loaders.
pub trait Classifier: Send {
    fn name(&self) -> &str;

    fn num_parameters(&self) -> usize;

    /// Unnormalized class scores, `(batch, num_classes)`.
    fn predict(&self, images: &Array2<f32>) -> Result<Array2<f32>, MlError>;

    /// One gradient step on `batch`; returns the mean training loss.
    fn train_step(&mut self, batch: &Batch, optimizer: &mut dyn Optimizer)
    -> Result<f64, MlError>;

    fn state(&self) -> Result<serde_json::Value, MlError>;

    fn load_state(&mut self, state: serde_json::Value) -> Result<(), MlError>;
}

/// Row-wise log-softmax of `logits`.
pub fn log_softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum = row.fold(0.0f32, |s, &v| s + (v - max).exp()).ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    out
}

/// Index of the largest value in each row. Ties go to the lowest index.
pub fn argmax_rows(scores: &Array2<f32>) -> Vec<usize> {
    scores
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
                    if v > max { (i, v) } else { (best, max) }
                })
                .0
        })
        .collect()
}

/// Build the model named in `config` for inputs of `input` shape.
pub fn build_model(
    config: &ModelConfig,
    input: ImageShape,
    num_classes: usize,
    seed: u64,
) -> Result<Box<dyn Classifier>, MlError> {
    let model: Box<dyn Classifier> = match config.name.as_str() {
        "linear" => {
            if !config.params.is_empty() {
                let keys: Vec<_> = config.params.keys().collect();
                warn!(?keys, "Linear model takes no parameters; ignoring");
            }
            Box::new(LinearClassifier::new(input.len(), num_classes, seed)?)
        }
        other => return Err(MlError::model(format!("unknown model '{other}'"))),
    };
    info!(
        model = model.name(),
        parameters = model.num_parameters(),
        "Model built"
    );
    Ok(model)
}
