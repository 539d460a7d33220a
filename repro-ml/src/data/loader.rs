//! Batched iteration over containers and the train/valid/test partitions.

use crate::config::DataConfig;
use crate::data::Partition;
use crate::data::container::{Container, ImageShape};
use crate::data::descriptor::DatasetDescriptor;
use crate::data::prepare::prepare_dataset;
use crate::data::transform::{self, Normalization};
use crate::error::MlError;
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A batch of normalized, flattened channel-first images and their labels.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, channels * height * width)`.
    pub images: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Split a container of `len` records into two contiguous halves.
pub fn split_ranges(len: usize) -> (Range<usize>, Range<usize>) {
    let mid = len / 2;
    (0..mid, mid..len)
}

/// Iterates a contiguous index range of a container in batches.
pub struct DataLoader {
    container: Arc<Container>,
    range: Range<usize>,
    batch_size: usize,
    shuffle: bool,
    augment: bool,
    normalization: Normalization,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(
        container: Arc<Container>,
        range: Range<usize>,
        batch_size: usize,
        normalization: Normalization,
    ) -> Result<Self, MlError> {
        if batch_size == 0 {
            return Err(MlError::invalid_input("batch_size must be positive"));
        }
        if range.end > container.len() || range.start > range.end {
            return Err(MlError::invalid_input(format!(
                "range {range:?} outside container of {} records",
                container.len()
            )));
        }
        if normalization.channels() != container.shape().channels as usize {
            return Err(MlError::invalid_input(format!(
                "normalization has {} channels, images have {}",
                normalization.channels(),
                container.shape().channels
            )));
        }
        Ok(Self {
            container,
            range,
            batch_size,
            shuffle: false,
            augment: false,
            normalization,
            rng: StdRng::seed_from_u64(0),
        })
    }

    /// Visit the range in a fresh random order each pass.
    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self
    }

    /// Apply random crop/flip augmentation.
    pub fn augmented(mut self, augment: bool) -> Self {
        self.augment = augment;
        self
    }

    /// Reset the sampling randomness.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn shape(&self) -> ImageShape {
        self.container.shape()
    }

    /// One pass over the range.
    pub fn batches(&mut self) -> Batches<'_> {
        let mut order: Vec<usize> = self.range.clone().collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        Batches {
            loader: self,
            order,
            position: 0,
        }
    }

    fn load_batch(&mut self, indices: &[usize]) -> Result<Batch, MlError> {
        let shape = self.container.shape();
        let mut images = Array2::<f32>::zeros((indices.len(), shape.len()));
        let mut labels = Vec::with_capacity(indices.len());
        let mut raw = vec![0u8; shape.len()];

        for (mut row, &index) in images.rows_mut().into_iter().zip(indices) {
            self.container.read_image(index, &mut raw)?;
            let label = self
                .container
                .label(index)
                .ok_or_else(|| MlError::dataset(format!("no label at index {index}")))?;

            let out = row
                .as_slice_mut()
                .ok_or_else(|| MlError::dataset("batch rows are not contiguous"))?;
            if self.augment {
                let augmented = transform::augment(&raw, shape, &mut self.rng);
                self.normalization.apply(&augmented, shape, out);
            } else {
                self.normalization.apply(&raw, shape, out);
            }
            labels.push(usize::from(label));
        }

        Ok(Batch { images, labels })
    }
}

/// Iterator over the batches of one pass.
pub struct Batches<'a> {
    loader: &'a mut DataLoader,
    order: Vec<usize>,
    position: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch, MlError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(self.order.len());
        let indices = self.order[self.position..end].to_vec();
        self.position = end;
        Some(self.loader.load_batch(&indices))
    }
}

/// Loaders for the three partitions of a dataset.
pub struct Partitions {
    pub train: DataLoader,
    pub valid: DataLoader,
    pub test: DataLoader,
    pub input: ImageShape,
    pub num_classes: usize,
}

impl Partitions {
    /// Shuffled train loader over `train`; the two halves of `val` become the
    /// validation and test partitions.
    pub fn from_containers(
        train: Container,
        val: Container,
        descriptor: &DatasetDescriptor,
        batch_size: usize,
        augment: bool,
    ) -> Result<Self, MlError> {
        for container in [&train, &val] {
            if container.shape() != descriptor.shape {
                return Err(MlError::dataset(format!(
                    "{} holds {:?} images, expected {:?}",
                    container.path().display(),
                    container.shape(),
                    descriptor.shape
                )));
            }
        }

        let train = Arc::new(train);
        let val = Arc::new(val);
        let (valid_range, test_range) = split_ranges(val.len());
        let norm = &descriptor.normalization;

        Ok(Self {
            train: DataLoader::new(train.clone(), 0..train.len(), batch_size, norm.clone())?
                .shuffled()
                .augmented(augment),
            valid: DataLoader::new(val.clone(), valid_range, batch_size, norm.clone())?,
            test: DataLoader::new(val, test_range, batch_size, norm.clone())?,
            input: descriptor.shape,
            num_classes: descriptor.num_classes,
        })
    }

    /// Open both containers of `descriptor` under `data_path`.
    pub fn open(
        data_path: &Path,
        descriptor: &DatasetDescriptor,
        batch_size: usize,
        augment: bool,
    ) -> Result<Self, MlError> {
        let train = Container::open(&descriptor.train_path(data_path))?;
        let val = Container::open(&descriptor.val_path(data_path))?;
        Self::from_containers(train, val, descriptor, batch_size, augment)
    }

    pub fn get_mut(&mut self, partition: Partition) -> &mut DataLoader {
        match partition {
            Partition::Train => &mut self.train,
            Partition::Valid => &mut self.valid,
            Partition::Test => &mut self.test,
        }
    }

    pub fn get(&self, partition: Partition) -> &DataLoader {
        match partition {
            Partition::Train => &self.train,
            Partition::Valid => &self.valid,
            Partition::Test => &self.test,
        }
    }
}

/// Prepare the configured dataset if needed and open its partitions.
pub async fn build_dataset(config: &DataConfig) -> Result<Partitions, MlError> {
    let descriptor = DatasetDescriptor::from_config(config)?;
    let outcome = prepare_dataset(
        &config.data_path,
        &descriptor,
        Duration::from_secs(config.lock_timeout_secs),
    )
    .await?;
    info!(dataset = %descriptor.name, ?outcome, "Dataset ready");

    if config.num_workers > 0 {
        debug!(
            num_workers = config.num_workers,
            "Batches are assembled on the training thread"
        );
    }

    let partitions = Partitions::open(
        &config.data_path,
        &descriptor,
        config.batch_size,
        config.augment,
    )?;
    info!(
        train = partitions.train.len(),
        valid = partitions.valid.len(),
        test = partitions.test.len(),
        input = ?partitions.input,
        num_classes = partitions.num_classes,
        "Datasets"
    );
    Ok(partitions)
}
