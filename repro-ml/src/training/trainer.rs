//! Resumable epoch loop.
//!
//! The trainer walks through four lifecycle points: started (restore or
//! initialize), epoch started (schedule and reseed), one training step per
//! batch, and epoch completed (evaluate, notify, checkpoint on a time gate).
//! On completion the checkpoint is cleared and the collected stats returned.

use crate::config::{ExperimentConfig, Seeds};
use crate::data::{DataLoader, Partition, Partitions};
use crate::error::MlError;
use crate::model::Classifier;
use crate::optim::{MultiStepLr, Optimizer};
use crate::training::callbacks::{CallbackAction, TrainingCallback};
use crate::training::checkpoint::{Checkpoint, CheckpointStore};
use crate::training::metrics::{EpochStats, EvalAccumulator, PartitionStats, TrainingReport};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

/// Source of wall-clock time for the checkpoint gate and epoch timing.
pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mutable progress of a run, visible to callbacks.
#[derive(Debug, Clone)]
pub struct EngineState {
    /// Last completed epoch (0 before any training).
    pub epoch: u64,
    pub iteration: u64,
    /// Loss of the most recent training step.
    pub output: f64,
    pub last_checkpoint: DateTime<Utc>,
    pub history: Vec<EpochStats>,
}

impl EngineState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            epoch: 0,
            iteration: 0,
            output: 0.0,
            last_checkpoint: now,
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub max_epochs: u64,
    /// Evaluated in train, valid, test order regardless of listing order.
    pub compute_error_rates: Vec<Partition>,
    /// A checkpoint is written once strictly more than this has elapsed.
    pub checkpoint_interval: TimeDelta,
    pub seeds: Seeds,
}

impl TrainerSettings {
    pub fn from_config(config: &ExperimentConfig, seeds: Seeds) -> Self {
        Self {
            max_epochs: config.max_epochs,
            compute_error_rates: config.compute_error_rates.clone(),
            checkpoint_interval: i64::try_from(config.checkpoint.interval_secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .unwrap_or(TimeDelta::MAX),
            seeds,
        }
    }
}

/// Loss and error rate of `model` over one pass of `loader`.
pub fn evaluate(model: &dyn Classifier, loader: &mut DataLoader) -> Result<PartitionStats, MlError> {
    let mut acc = EvalAccumulator::new();
    for batch in loader.batches() {
        let batch = batch?;
        let scores = model.predict(&batch.images)?;
        acc.add(&scores, &batch.labels)?;
    }
    acc.finish()
}

pub struct Trainer {
    model: Box<dyn Classifier>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<MultiStepLr>,
    data: Partitions,
    store: Box<dyn CheckpointStore>,
    clock: Box<dyn Clock>,
    callbacks: Vec<Box<dyn TrainingCallback>>,
    settings: TrainerSettings,
    state: EngineState,
}

impl Trainer {
    pub fn new(
        model: Box<dyn Classifier>,
        optimizer: Box<dyn Optimizer>,
        data: Partitions,
        store: Box<dyn CheckpointStore>,
        settings: TrainerSettings,
    ) -> Self {
        Self {
            model,
            optimizer,
            scheduler: None,
            data,
            store,
            clock: Box::new(SystemClock),
            callbacks: Vec::new(),
            settings,
            state: EngineState::new(Utc::now()),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Option<MultiStepLr>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_callback(mut self, callback: impl TrainingCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Train until `max_epochs`, resuming from the store when it holds a checkpoint.
    pub fn run(&mut self) -> Result<TrainingReport, MlError> {
        info!(max_epochs = self.settings.max_epochs, "Training");
        self.started()?;

        let run_started = self.clock.now();
        let mut epochs_run = 0u64;
        while self.state.epoch < self.settings.max_epochs {
            self.state.epoch += 1;
            self.epoch_started();
            self.run_epoch()?;
            epochs_run += 1;
            if self.epoch_completed(run_started, epochs_run)? == CallbackAction::Stop {
                info!(epoch = self.state.epoch, "Stopped by callback");
                break;
            }
        }

        self.store.clear()?;
        let last = self
            .state
            .history
            .last()
            .cloned()
            .ok_or_else(|| MlError::training("no epoch stats recorded"))?;
        Ok(TrainingReport {
            last,
            all: self.state.history.clone(),
        })
    }

    fn started(&mut self) -> Result<(), MlError> {
        self.state = EngineState::new(self.clock.now());

        let Some(checkpoint) = self.store.load()? else {
            let stats = self.compute_stats()?;
            self.log_stats(&stats);
            self.state.history.push(stats);
            return self.save_checkpoint();
        };

        info!(
            epoch = checkpoint.epoch,
            iteration = checkpoint.iteration,
            "Resuming from checkpoint"
        );
        self.model.load_state(checkpoint.model)?;
        self.optimizer.load_state(checkpoint.optimizer)?;
        match (&mut self.scheduler, checkpoint.scheduler) {
            (Some(current), Some(saved)) => *current = saved,
            (None, Some(_)) => warn!("Checkpoint has a learning-rate schedule; none is configured"),
            _ => {}
        }
        self.state.epoch = checkpoint.epoch;
        self.state.iteration = checkpoint.iteration;
        self.state.history = checkpoint.history;
        Ok(())
    }

    fn epoch_started(&mut self) {
        let epoch = self.state.epoch;
        if let Some(scheduler) = &mut self.scheduler {
            let lr = scheduler.step(epoch - 1);
            self.optimizer.set_learning_rate(lr);
            debug!(epoch, lr, "Learning rate");
        }
        self.data.train.reseed(self.settings.seeds.epoch_seed(epoch));
    }

    fn run_epoch(&mut self) -> Result<(), MlError> {
        for batch in self.data.train.batches() {
            let batch = batch?;
            self.state.output = self.model.train_step(&batch, &mut *self.optimizer)?;
            self.state.iteration += 1;
        }
        Ok(())
    }

    fn epoch_completed(
        &mut self,
        run_started: DateTime<Utc>,
        epochs_run: u64,
    ) -> Result<CallbackAction, MlError> {
        let stats = self.compute_stats()?;
        self.log_stats(&stats);
        self.state.history.push(stats);

        let elapsed = self.clock.now() - run_started;
        info!(
            epoch = self.state.epoch,
            iteration = self.state.iteration,
            loss = self.state.output,
            avg_epoch_secs = elapsed.num_milliseconds() as f64 / 1000.0 / epochs_run as f64,
            "Epoch completed"
        );

        let mut action = CallbackAction::Continue;
        for callback in &mut self.callbacks {
            if callback.on_epoch_end(&self.state) == CallbackAction::Stop {
                action = CallbackAction::Stop;
            }
        }

        if self.clock.now() - self.state.last_checkpoint > self.settings.checkpoint_interval {
            self.save_checkpoint()?;
        }
        Ok(action)
    }

    fn compute_stats(&mut self) -> Result<EpochStats, MlError> {
        let mut stats = EpochStats::new(self.state.epoch);
        for partition in Partition::ALL {
            if !self.settings.compute_error_rates.contains(&partition) {
                continue;
            }
            let loader = self.data.get_mut(partition);
            let result = evaluate(&*self.model, loader)?;
            stats.partitions.insert(partition, result);
        }
        Ok(stats)
    }

    fn log_stats(&self, stats: &EpochStats) {
        for (partition, s) in &stats.partitions {
            debug!(
                epoch = stats.epoch,
                partition = %partition,
                loss = s.loss,
                error_rate = s.error_rate,
                "Evaluation"
            );
        }
    }

    fn save_checkpoint(&mut self) -> Result<(), MlError> {
        let now = self.clock.now();
        info!(epoch = self.state.epoch, "Checkpointing");
        let checkpoint = Checkpoint {
            epoch: self.state.epoch,
            iteration: self.state.iteration,
            model: self.model.state()?,
            optimizer: self.optimizer.state()?,
            scheduler: self.scheduler.clone(),
            history: self.state.history.clone(),
            saved_at: now,
        };
        self.store.save(&checkpoint)?;
        self.state.last_checkpoint = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Container, ContainerWriter, DatasetDescriptor, ImageShape, Normalization};
    use crate::model::LinearClassifier;
    use crate::optim::Sgd;
    use crate::training::checkpoint::{FileCheckpointStore, InMemoryCheckpointStore};
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    const SHAPE: ImageShape = ImageShape::new(2, 2, 1);

    fn descriptor() -> DatasetDescriptor {
        DatasetDescriptor {
            name: "toy".into(),
            url: String::new(),
            dir_name: "toy".into(),
            archive_name: "toy.zip".into(),
            train_file: "train.bin".into(),
            val_file: "val.bin".into(),
            train_count: 8,
            val_count: 4,
            shape: SHAPE,
            num_classes: 2,
            normalization: Normalization::new(vec![0.5], vec![0.5]),
        }
    }

    fn write(path: &Path, count: u64) {
        let mut writer = ContainerWriter::create(path, count, SHAPE).unwrap();
        for i in 0..count {
            let label = (i % 2) as u8;
            let base = if label == 0 { 20 } else { 220 };
            writer.push(&[base + i as u8; 4], label).unwrap();
        }
        writer.finish().unwrap();
    }

    fn partitions(dir: &TempDir) -> Partitions {
        let d = descriptor();
        write(&d.train_path(dir.path()), d.train_count);
        write(&d.val_path(dir.path()), d.val_count);
        let train = Container::open(&d.train_path(dir.path())).unwrap();
        let val = Container::open(&d.val_path(dir.path())).unwrap();
        Partitions::from_containers(train, val, &d, 4, false).unwrap()
    }

    fn settings(max_epochs: u64, interval_secs: i64) -> TrainerSettings {
        TrainerSettings {
            max_epochs,
            compute_error_rates: vec![Partition::Valid, Partition::Train],
            checkpoint_interval: TimeDelta::seconds(interval_secs),
            seeds: Seeds {
                model: 1,
                sampler: 1,
            },
        }
    }

    fn trainer(
        dir: &TempDir,
        model_seed: u64,
        store: impl CheckpointStore + 'static,
        settings: TrainerSettings,
    ) -> Trainer {
        Trainer::new(
            Box::new(LinearClassifier::new(SHAPE.len(), 2, model_seed).unwrap()),
            Box::new(Sgd::new(0.5, 0.9, 0.0).unwrap()),
            partitions(dir),
            Box::new(store),
            settings,
        )
    }

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

    impl ManualClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Utc::now())))
        }

        fn advance(&self, secs: i64) {
            *self.0.lock().unwrap() += TimeDelta::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Keeps every saved checkpoint in addition to the live slot.
    #[derive(Clone, Default)]
    struct RecordingStore {
        inner: InMemoryCheckpointStore,
        saved: Arc<Mutex<Vec<Checkpoint>>>,
    }

    impl CheckpointStore for RecordingStore {
        fn load(&self) -> Result<Option<Checkpoint>, MlError> {
            self.inner.load()
        }

        fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), MlError> {
            self.saved.lock().unwrap().push(checkpoint.clone());
            self.inner.save(checkpoint)
        }

        fn clear(&mut self) -> Result<(), MlError> {
            self.inner.clear()
        }
    }

    fn ticking(clock: &ManualClock, secs: i64) -> impl TrainingCallback + 'static {
        let clock = clock.clone();
        move |_: &EngineState| {
            clock.advance(secs);
            CallbackAction::Continue
        }
    }

    #[test]
    fn test_checkpoints_follow_the_time_gate() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = RecordingStore::default();

        let mut trainer = trainer(&dir, 1, store.clone(), settings(5, 300))
            .with_clock(clock.clone())
            .with_callback(ticking(&clock, 200));
        let report = trainer.run().unwrap();

        let epochs: Vec<u64> = store.saved.lock().unwrap().iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![0, 2, 4]);
        assert!(store.load().unwrap().is_none(), "cleared on completion");

        assert_eq!(report.all.len(), 6);
        assert_eq!(report.last, report.all[5]);
        assert_eq!(
            report.all.iter().map(|s| s.epoch).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4, 5]
        );
        let keys: Vec<_> = report.last.partitions.keys().copied().collect();
        assert_eq!(keys, vec![Partition::Train, Partition::Valid]);
        assert_eq!(trainer.state().iteration, 10);
    }

    #[test]
    fn test_elapsed_equal_to_interval_does_not_save() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = RecordingStore::default();
        trainer(&dir, 1, store.clone(), settings(4, 300))
            .with_clock(clock.clone())
            .with_callback(ticking(&clock, 300))
            .run()
            .unwrap();
        let epochs: Vec<u64> = store.saved.lock().unwrap().iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![0, 2, 4]);

        let other = TempDir::new().unwrap();
        let store = RecordingStore::default();
        trainer(&other, 1, store.clone(), settings(4, 300))
            .with_clock(clock.clone())
            .with_callback(ticking(&clock, 150))
            .run()
            .unwrap();
        let epochs: Vec<u64> = store.saved.lock().unwrap().iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![0, 3]);
    }

    #[test]
    fn test_resume_from_file_store_matches_uninterrupted_run() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = RecordingStore::default();
        let expected = trainer(&dir, 1, store.clone(), settings(4, 300))
            .with_clock(clock.clone())
            .with_callback(ticking(&clock, 400))
            .run()
            .unwrap();
        let at_epoch_2 = store.saved.lock().unwrap()[2].clone();

        let checkpoints = TempDir::new().unwrap();
        let mut file_store = FileCheckpointStore::new(checkpoints.path(), "resume").unwrap();
        file_store.save(&at_epoch_2).unwrap();

        let other = TempDir::new().unwrap();
        let report = trainer(&other, 99, file_store.clone(), settings(4, 300))
            .run()
            .unwrap();
        assert_eq!(report, expected);
        assert!(file_store.load().unwrap().is_none());
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let store = RecordingStore::default();
        let mut straight = trainer(&dir, 1, store.clone(), settings(4, 300))
            .with_clock(clock.clone())
            .with_callback(ticking(&clock, 400));
        let expected = straight.run().unwrap();

        let at_epoch_2 = store.saved.lock().unwrap()[2].clone();
        assert_eq!(at_epoch_2.epoch, 2);
        assert_eq!(at_epoch_2.iteration, 4);

        let other = TempDir::new().unwrap();
        let resumed_store = InMemoryCheckpointStore::with_checkpoint(at_epoch_2);
        let mut resumed = trainer(&other, 99, resumed_store.clone(), settings(4, 300));
        let report = resumed.run().unwrap();

        assert_eq!(report, expected);
        assert_eq!(resumed.state().iteration, 8);
        assert!(resumed_store.load().unwrap().is_none());
    }

    #[test]
    fn test_resume_past_max_epochs_does_not_train() {
        let dir = TempDir::new().unwrap();
        let store = RecordingStore::default();
        let mut first = trainer(&dir, 1, store.clone(), settings(1, 0));
        first.run().unwrap();
        let initial = store.saved.lock().unwrap()[0].clone();

        let mut done = initial.clone();
        done.epoch = 3;
        let other = TempDir::new().unwrap();
        let mut trainer = trainer(
            &other,
            1,
            InMemoryCheckpointStore::with_checkpoint(done),
            settings(2, 300),
        );
        let report = trainer.run().unwrap();
        assert_eq!(report.all, initial.history);
        assert_eq!(trainer.state().iteration, 0);
    }

    #[test]
    fn test_schedule_sets_learning_rate_per_epoch() {
        let dir = TempDir::new().unwrap();
        let schedule = MultiStepLr::new(0.5, vec![2], 0.1).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = {
            let seen = seen.clone();
            move |s: &EngineState| {
                seen.lock().unwrap().push(s.epoch);
                CallbackAction::Continue
            }
        };
        let mut trainer = trainer(&dir, 1, InMemoryCheckpointStore::new(), settings(3, 300))
            .with_scheduler(Some(schedule))
            .with_callback(record);
        trainer.run().unwrap();

        assert!((trainer.learning_rate() - 0.05).abs() < 1e-12);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_callback_stop_ends_run_and_clears() {
        let dir = TempDir::new().unwrap();
        let store = InMemoryCheckpointStore::new();
        let stop_at_two = |s: &EngineState| {
            if s.epoch >= 2 {
                CallbackAction::Stop
            } else {
                CallbackAction::Continue
            }
        };
        let mut trainer =
            trainer(&dir, 1, store.clone(), settings(10, 300)).with_callback(stop_at_two);
        let report = trainer.run().unwrap();
        assert_eq!(report.last.epoch, 2);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_no_error_rates_still_records_epochs() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(2, 300);
        s.compute_error_rates.clear();
        let report = trainer(&dir, 1, InMemoryCheckpointStore::new(), s)
            .run()
            .unwrap();
        assert_eq!(report.all.len(), 3);
        assert!(report.last.partitions.is_empty());
    }
}
