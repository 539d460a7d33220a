//! Dataset preparation and loading: archives, binary containers, partitions.

pub mod container;
pub mod descriptor;
pub mod download;
pub mod layout;
pub mod loader;
pub mod prepare;
pub mod transform;

pub use container::{Container, ContainerWriter, ImageShape};
pub use descriptor::DatasetDescriptor;
pub use loader::{Batch, DataLoader, Partitions, build_dataset, split_ranges};
pub use prepare::{PrepareOutcome, prepare_dataset};
pub use transform::Normalization;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the train/validation/test subsets of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Train,
    Valid,
    Test,
}

impl Partition {
    /// Evaluation order.
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Valid, Partition::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Valid => "valid",
            Partition::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Partition {
    type Err = crate::error::MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Partition::Train),
            "valid" => Ok(Partition::Valid),
            "test" => Ok(Partition::Test),
            other => Err(crate::error::MlError::invalid_input(format!(
                "unknown partition '{other}'"
            ))),
        }
    }
}
