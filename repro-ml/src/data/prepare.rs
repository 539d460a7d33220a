//! One-time conversion of a dataset archive into binary containers.
//!
//! Jobs launched concurrently against the same data directory coordinate
//! through a file lock. A job that cannot get the lock in time moves on and
//! tries to use whatever containers exist.

use crate::data::container::ContainerWriter;
use crate::data::descriptor::DatasetDescriptor;
use crate::data::download::download_archive;
use crate::data::layout::{self, ImageRecord};
use crate::error::MlError;
use repro_core::FileLock;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// What [`prepare_dataset`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Both containers were already present.
    AlreadyPrepared,
    /// This process built the containers.
    Built,
    /// Another process held the lock past the timeout.
    LockTimedOut,
}

/// Removes the extracted archive tree when dropped.
struct ExtractedTree(PathBuf);

impl Drop for ExtractedTree {
    fn drop(&mut self) {
        if !self.0.exists() {
            return;
        }
        info!(path = %self.0.display(), "Deleting unzipped files");
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            warn!(path = %self.0.display(), error = %e, "Failed to delete unzipped files");
        }
    }
}

/// Ensure the train and validation containers of `descriptor` exist in `data_path`.
pub async fn prepare_dataset(
    data_path: &Path,
    descriptor: &DatasetDescriptor,
    timeout: Duration,
) -> Result<PrepareOutcome, MlError> {
    if descriptor.containers_exist(data_path) {
        return Ok(PrepareOutcome::AlreadyPrepared);
    }

    std::fs::create_dir_all(data_path)?;
    let lock_path = descriptor.lock_path(data_path);
    let _lock = match FileLock::acquire(&lock_path, timeout).await {
        Ok(lock) => lock,
        Err(e) if e.is_timeout() => {
            warn!(
                lock = %lock_path.display(),
                timeout_secs = timeout.as_secs(),
                "Another process holds the dataset lock; will try to load the dataset anyway"
            );
            return Ok(PrepareOutcome::LockTimedOut);
        }
        Err(e) => return Err(e.into()),
    };

    // Built by whoever held the lock before us.
    if descriptor.containers_exist(data_path) {
        info!(dataset = %descriptor.name, "Containers appeared while waiting for the lock");
        return Ok(PrepareOutcome::AlreadyPrepared);
    }

    let archive = descriptor.archive_path(data_path);
    if archive.exists() {
        info!(path = %archive.display(), "Archive already downloaded");
    } else {
        download_archive(&descriptor.url, &archive).await?;
    }

    let tree = ExtractedTree(descriptor.extracted_dir(data_path));
    let data_path = data_path.to_path_buf();
    let descriptor = descriptor.clone();
    tokio::task::spawn_blocking(move || {
        extract_archive(&archive, &data_path)?;
        build_containers(&tree.0, &data_path, &descriptor)
    })
    .await
    .map_err(|e| MlError::dataset(format!("dataset conversion task failed: {e}")))??;

    Ok(PrepareOutcome::Built)
}

fn extract_archive(archive: &Path, into: &Path) -> Result<(), MlError> {
    info!(path = %archive.display(), "Unzipping files");
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    zip.extract(into)?;
    info!("Unzip done");
    Ok(())
}

/// Convert the extracted tree into the train and validation containers.
pub fn build_containers(
    root: &Path,
    data_path: &Path,
    descriptor: &DatasetDescriptor,
) -> Result<(), MlError> {
    let classes = layout::class_index(root)?;
    if classes.len() != descriptor.num_classes {
        return Err(MlError::dataset(format!(
            "found {} classes under {}, expected {}",
            classes.len(),
            root.display(),
            descriptor.num_classes
        )));
    }

    let train = layout::train_records(root, &classes)?;
    write_container(
        &train,
        &descriptor.train_path(data_path),
        descriptor.train_count,
        descriptor,
    )?;

    let val = layout::val_records(root, &classes)?;
    write_container(
        &val,
        &descriptor.val_path(data_path),
        descriptor.val_count,
        descriptor,
    )?;
    Ok(())
}

fn write_container(
    records: &[ImageRecord],
    path: &Path,
    count: u64,
    descriptor: &DatasetDescriptor,
) -> Result<(), MlError> {
    info!(path = %path.display(), records = records.len(), "Writing container");
    let mut writer = ContainerWriter::create(path, count, descriptor.shape)?;
    for record in records {
        let image = layout::load_image(&record.path, descriptor.shape)?;
        writer.push(&image, record.label)?;
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::container::{Container, ImageShape};
    use crate::data::transform::Normalization;
    use std::io::Write;
    use tempfile::TempDir;

    fn tiny_descriptor() -> DatasetDescriptor {
        DatasetDescriptor {
            name: "tiny".into(),
            // Never contacted: the archive is staged locally.
            url: "http://127.0.0.1:9/unreachable.zip".into(),
            dir_name: "tiny".into(),
            archive_name: "tiny.zip".into(),
            train_file: "tiny_train.bin".into(),
            val_file: "tiny_val.bin".into(),
            train_count: 4,
            val_count: 2,
            shape: ImageShape::new(2, 2, 3),
            num_classes: 2,
            normalization: Normalization::new(vec![0.5; 3], vec![0.25; 3]),
        }
    }

    fn png_bytes(value: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbImage::from_pixel(2, 2, image::Rgb([value, value, value]))
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .unwrap();
        bytes
    }

    fn stage_archive(data_path: &Path) {
        stage_archive_with(data_path, png_bytes(21));
    }

    fn stage_archive_with(data_path: &Path, last_train_image: Vec<u8>) {
        let file = std::fs::File::create(data_path.join("tiny.zip")).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        let mut add = |name: &str, bytes: &[u8]| {
            zip.start_file(name, options).unwrap();
            zip.write_all(bytes).unwrap();
        };
        add("tiny/train/a/images/a_0.png", &png_bytes(10));
        add("tiny/train/a/images/a_1.png", &png_bytes(11));
        add("tiny/train/b/images/b_0.png", &png_bytes(20));
        add("tiny/train/b/images/b_1.png", &last_train_image);
        add("tiny/val/images/v_0.png", &png_bytes(30));
        add("tiny/val/images/v_1.png", &png_bytes(31));
        add("tiny/val/val_annotations.txt", b"v_0.png\tb\nv_1.png\ta\n");
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_builds_containers_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let d = tiny_descriptor();
        stage_archive(dir.path());

        let outcome = prepare_dataset(dir.path(), &d, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, PrepareOutcome::Built);
        assert!(!d.extracted_dir(dir.path()).exists());

        let train = Container::open(&d.train_path(dir.path())).unwrap();
        assert_eq!(train.len(), 4);
        assert_eq!(train.get(2).unwrap(), (vec![20u8; 12], 1));

        let val = Container::open(&d.val_path(dir.path())).unwrap();
        assert_eq!(val.get(0).unwrap(), (vec![30u8; 12], 1));
        assert_eq!(val.get(1).unwrap(), (vec![31u8; 12], 0));
    }

    #[tokio::test]
    async fn test_existing_containers_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let d = tiny_descriptor();
        std::fs::write(d.train_path(dir.path()), b"train").unwrap();
        std::fs::write(d.val_path(dir.path()), b"val").unwrap();

        let outcome = prepare_dataset(dir.path(), &d, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, PrepareOutcome::AlreadyPrepared);
        assert!(!d.lock_path(dir.path()).exists());
        assert!(!d.archive_path(dir.path()).exists());
        assert_eq!(std::fs::read(d.train_path(dir.path())).unwrap(), b"train");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lock_timeout_degrades() {
        let dir = TempDir::new().unwrap();
        let d = tiny_descriptor();
        let _held = FileLock::try_acquire(&d.lock_path(dir.path()))
            .unwrap()
            .unwrap();

        let outcome = prepare_dataset(dir.path(), &d, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, PrepareOutcome::LockTimedOut);
    }

    #[tokio::test]
    async fn test_count_mismatch_still_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut d = tiny_descriptor();
        d.train_count = 5;
        stage_archive(dir.path());

        let err = prepare_dataset(dir.path(), &d, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected 5 records"));
        assert!(!d.extracted_dir(dir.path()).exists());
        assert!(!d.train_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_decode_error_leaves_no_partial_container() {
        let dir = TempDir::new().unwrap();
        let d = tiny_descriptor();
        stage_archive_with(dir.path(), b"not a png".to_vec());

        let err = prepare_dataset(dir.path(), &d, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Image(_)), "{err}");
        let train = d.train_path(dir.path());
        assert!(!train.exists());
        assert!(!repro_core::persistence::tmp_path(&train).exists());
        assert!(!d.extracted_dir(dir.path()).exists());
    }
}
