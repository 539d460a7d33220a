//! Hooks notified at the end of every epoch.

use crate::training::trainer::EngineState;
use tracing::warn;

/// Action a callback can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Trait for training callbacks.
pub trait TrainingCallback: Send {
    /// Called after the epoch's stats were appended to `state.history`.
    fn on_epoch_end(&mut self, state: &EngineState) -> CallbackAction;
}

/// Stops the run once the training loss is NaN or infinite.
#[derive(Debug, Clone, Default)]
pub struct NonFiniteLossCallback;

impl TrainingCallback for NonFiniteLossCallback {
    fn on_epoch_end(&mut self, state: &EngineState) -> CallbackAction {
        if state.output.is_finite() {
            return CallbackAction::Continue;
        }
        warn!(
            epoch = state.epoch,
            iteration = state.iteration,
            loss = state.output,
            "Training loss diverged; stopping"
        );
        CallbackAction::Stop
    }
}

impl<F> TrainingCallback for F
where
    F: FnMut(&EngineState) -> CallbackAction + Send,
{
    fn on_epoch_end(&mut self, state: &EngineState) -> CallbackAction {
        self(state)
    }
}
