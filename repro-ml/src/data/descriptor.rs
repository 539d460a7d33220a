//! Dataset descriptors: where an archive comes from and what its containers hold.

use crate::config::DataConfig;
use crate::data::container::ImageShape;
use crate::data::transform::Normalization;
use crate::error::MlError;
use std::path::{Path, PathBuf};

/// Everything needed to prepare and load one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDescriptor {
    pub name: String,
    pub url: String,
    /// Top-level directory inside the archive.
    pub dir_name: String,
    pub archive_name: String,
    pub train_file: String,
    pub val_file: String,
    pub train_count: u64,
    pub val_count: u64,
    pub shape: ImageShape,
    pub num_classes: usize,
    pub normalization: Normalization,
}

impl DatasetDescriptor {
    /// Tiny ImageNet: 200 classes of 64x64 RGB images.
    pub fn tiny_imagenet() -> Self {
        Self {
            name: "tinyimagenet".into(),
            url: "http://cs231n.stanford.edu/tiny-imagenet-200.zip".into(),
            dir_name: "tiny-imagenet-200".into(),
            archive_name: "tiny-imagenet-200.zip".into(),
            train_file: "tinyimagenet_train.bin".into(),
            val_file: "tinyimagenet_val.bin".into(),
            train_count: 100_000,
            val_count: 10_000,
            shape: ImageShape::new(64, 64, 3),
            num_classes: 200,
            normalization: Normalization::new(
                vec![0.4194, 0.3898, 0.3454],
                vec![0.303, 0.291, 0.293],
            ),
        }
    }

    /// Look up a registered dataset by name.
    pub fn by_name(name: &str) -> Result<Self, MlError> {
        match name {
            "tinyimagenet" => Ok(Self::tiny_imagenet()),
            other => Err(MlError::invalid_input(format!("unknown dataset '{other}'"))),
        }
    }

    /// Registered descriptor with config-level overrides applied.
    pub fn from_config(config: &DataConfig) -> Result<Self, MlError> {
        let mut descriptor = Self::by_name(&config.name)?;
        if let Some(url) = &config.url {
            descriptor.url = url.clone();
        }
        Ok(descriptor)
    }

    pub fn archive_path(&self, data_path: &Path) -> PathBuf {
        data_path.join(&self.archive_name)
    }

    pub fn extracted_dir(&self, data_path: &Path) -> PathBuf {
        data_path.join(&self.dir_name)
    }

    pub fn lock_path(&self, data_path: &Path) -> PathBuf {
        data_path.join(format!("{}.lock", self.dir_name))
    }

    pub fn train_path(&self, data_path: &Path) -> PathBuf {
        data_path.join(&self.train_file)
    }

    pub fn val_path(&self, data_path: &Path) -> PathBuf {
        data_path.join(&self.val_file)
    }

    pub fn containers_exist(&self, data_path: &Path) -> bool {
        self.train_path(data_path).exists() && self.val_path(data_path).exists()
    }
}
