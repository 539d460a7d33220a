//! Random-access binary container for fixed-shape `u8` images and labels.
//!
//! Layout (little endian):
//!
//! ```text
//! b"RPRC" | version: u32 | count: u64 | height: u32 | width: u32 | channels: u32
//! count * height * width * channels image bytes (channel-last)
//! count label bytes
//! ```

use crate::error::MlError;
use repro_core::persistence::tmp_path;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const MAGIC: &[u8; 4] = b"RPRC";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 4 + 4 + 8 + 4 + 4 + 4;

/// Shape of one stored image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl ImageShape {
    pub const fn new(height: u32, width: u32, channels: u32) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Number of bytes (or values) in one image.
    pub fn len(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Streaming writer producing a container with a fixed record count.
///
/// Records go to a `.tmp` sibling; [`ContainerWriter::finish`] renames it into
/// place only once every record has been written. A writer dropped before that
/// removes the partial file.
pub struct ContainerWriter {
    out: BufWriter<File>,
    tmp: PathBuf,
    path: PathBuf,
    shape: ImageShape,
    capacity: u64,
    labels: Vec<u8>,
    finished: bool,
}

impl ContainerWriter {
    pub fn create(path: &Path, capacity: u64, shape: ImageShape) -> Result<Self, MlError> {
        if shape.is_empty() {
            return Err(MlError::invalid_input("container image shape is empty"));
        }
        let tmp = tmp_path(path);
        let mut out = BufWriter::new(File::create(&tmp)?);
        out.write_all(MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        out.write_all(&capacity.to_le_bytes())?;
        out.write_all(&shape.height.to_le_bytes())?;
        out.write_all(&shape.width.to_le_bytes())?;
        out.write_all(&shape.channels.to_le_bytes())?;

        Ok(Self {
            out,
            tmp,
            path: path.to_path_buf(),
            shape,
            capacity,
            labels: Vec::with_capacity(capacity as usize),
            finished: false,
        })
    }

    /// Append one record.
    pub fn push(&mut self, image: &[u8], label: u8) -> Result<(), MlError> {
        if image.len() != self.shape.len() {
            return Err(MlError::dataset(format!(
                "image has {} bytes, container expects {}",
                image.len(),
                self.shape.len()
            )));
        }
        if self.labels.len() as u64 >= self.capacity {
            return Err(MlError::dataset(format!(
                "container {} is full ({} records)",
                self.path.display(),
                self.capacity
            )));
        }
        self.out.write_all(image)?;
        self.labels.push(label);
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.labels.len() as u64
    }

    /// Write the label block and move the container into place.
    pub fn finish(mut self) -> Result<PathBuf, MlError> {
        if self.written() != self.capacity {
            return Err(MlError::dataset(format!(
                "expected {} records for {}, got {}",
                self.capacity,
                self.path.display(),
                self.written()
            )));
        }
        self.out.write_all(&self.labels)?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        std::fs::rename(&self.tmp, &self.path)?;
        self.finished = true;
        Ok(self.path.clone())
    }
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

/// Read-only container opened for random access.
#[derive(Debug)]
pub struct Container {
    file: Mutex<File>,
    path: PathBuf,
    shape: ImageShape,
    labels: Vec<u8>,
}

impl Container {
    pub fn open(path: &Path) -> Result<Self, MlError> {
        let mut file = File::open(path).map_err(|e| {
            MlError::dataset(format!("cannot open container {}: {e}", path.display()))
        })?;

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(MlError::dataset(format!(
                "{} is not a repro container",
                path.display()
            )));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap_or_default());
        if version != VERSION {
            return Err(MlError::dataset(format!(
                "unsupported container version {version} in {}",
                path.display()
            )));
        }
        let count = u64::from_le_bytes(header[8..16].try_into().unwrap_or_default());
        let shape = ImageShape::new(
            u32::from_le_bytes(header[16..20].try_into().unwrap_or_default()),
            u32::from_le_bytes(header[20..24].try_into().unwrap_or_default()),
            u32::from_le_bytes(header[24..28].try_into().unwrap_or_default()),
        );

        let corrupt = || {
            MlError::dataset(format!(
                "container {} has a corrupt header ({count} records of {shape:?})",
                path.display()
            ))
        };
        let data_len = u64::from(shape.height)
            .checked_mul(u64::from(shape.width))
            .and_then(|n| n.checked_mul(u64::from(shape.channels)))
            .and_then(|n| n.checked_mul(count))
            .ok_or_else(corrupt)?;
        let expected = data_len
            .checked_add(HEADER_LEN)
            .and_then(|n| n.checked_add(count))
            .ok_or_else(corrupt)?;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(MlError::dataset(format!(
                "container {} is {actual} bytes, expected {expected}",
                path.display()
            )));
        }

        let mut labels = vec![0u8; count as usize];
        file.seek(SeekFrom::Start(HEADER_LEN + data_len))?;
        file.read_exact(&mut labels)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            shape,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn label(&self, index: usize) -> Option<u8> {
        self.labels.get(index).copied()
    }

    /// Read image `index` into `buf` (`buf.len()` must equal the image size).
    pub fn read_image(&self, index: usize, buf: &mut [u8]) -> Result<(), MlError> {
        if index >= self.len() {
            return Err(MlError::invalid_input(format!(
                "index {index} out of range for container of {} records",
                self.len()
            )));
        }
        if buf.len() != self.shape.len() {
            return Err(MlError::invalid_input(format!(
                "buffer has {} bytes, image needs {}",
                buf.len(),
                self.shape.len()
            )));
        }
        let offset = HEADER_LEN + (index * self.shape.len()) as u64;
        let mut file = self
            .file
            .lock()
            .map_err(|_| MlError::dataset("container file handle poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Image and label at `index`.
    pub fn get(&self, index: usize) -> Result<(Vec<u8>, u8), MlError> {
        let mut image = vec![0u8; self.shape.len()];
        self.read_image(index, &mut image)?;
        Ok((image, self.labels[index]))
    }
}
