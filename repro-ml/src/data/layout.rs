//! Walking an extracted image-folder archive.
//!
//! Training images live under `train/<class>/**`; classes are indexed by their
//! sorted directory names. Validation images sit flat in `val/images/` and are
//! labelled by `val/val_annotations.txt` (`filename<TAB>class<TAB>...`).

use crate::data::container::ImageShape;
use crate::error::MlError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png", "bmp", "ppm"];

/// One image file and its class index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub label: u8,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Map class directory names under `train/` to label indices.
pub fn class_index(root: &Path) -> Result<BTreeMap<String, u8>, MlError> {
    let train_dir = root.join("train");
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&train_dir).map_err(|e| {
        MlError::dataset(format!("cannot list {}: {e}", train_dir.display()))
    })? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();

    if names.len() > usize::from(u8::MAX) + 1 {
        return Err(MlError::dataset(format!(
            "{} classes do not fit in a u8 label",
            names.len()
        )));
    }

    Ok(names
        .into_iter()
        .enumerate()
        .map(|(i, name)| (name, i as u8))
        .collect())
}

/// Training images ordered by class, then by path.
pub fn train_records(
    root: &Path,
    classes: &BTreeMap<String, u8>,
) -> Result<Vec<ImageRecord>, MlError> {
    let mut records = Vec::new();
    for (name, &label) in classes {
        for entry in WalkDir::new(root.join("train").join(name)).sort_by_file_name() {
            let entry = entry.map_err(|e| MlError::dataset(e.to_string()))?;
            if entry.file_type().is_file() && is_image(entry.path()) {
                records.push(ImageRecord {
                    path: entry.into_path(),
                    label,
                });
            }
        }
    }
    Ok(records)
}

/// Validation images in annotation-file order.
pub fn val_records(
    root: &Path,
    classes: &BTreeMap<String, u8>,
) -> Result<Vec<ImageRecord>, MlError> {
    let val_dir = root.join("val");
    let annotations = std::fs::read_to_string(val_dir.join("val_annotations.txt"))?;

    let mut records = Vec::new();
    for (line_no, line) in annotations.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (Some(filename), Some(class)) = (fields.next(), fields.next()) else {
            return Err(MlError::dataset(format!(
                "val_annotations.txt:{}: expected filename and class",
                line_no + 1
            )));
        };
        let label = *classes.get(class).ok_or_else(|| {
            MlError::dataset(format!(
                "val_annotations.txt:{}: unknown class '{class}'",
                line_no + 1
            ))
        })?;
        records.push(ImageRecord {
            path: val_dir.join("images").join(filename),
            label,
        });
    }
    Ok(records)
}

/// Decode an image file into channel-last bytes of the expected shape.
pub fn load_image(path: &Path, shape: ImageShape) -> Result<Vec<u8>, MlError> {
    let decoded = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;

    if decoded.width() != shape.width || decoded.height() != shape.height {
        return Err(MlError::dataset(format!(
            "{} is {}x{}, expected {}x{}",
            path.display(),
            decoded.width(),
            decoded.height(),
            shape.width,
            shape.height
        )));
    }

    match shape.channels {
        1 => Ok(decoded.to_luma8().into_raw()),
        3 => Ok(decoded.to_rgb8().into_raw()),
        n => Err(MlError::dataset(format!("unsupported channel count {n}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch_image(path: &Path, value: u8) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        image::RgbImage::from_pixel(2, 2, image::Rgb([value, value, value]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_walk_train_and_val() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch_image(&root.join("train/n02/images/n02_1.png"), 1);
        touch_image(&root.join("train/n01/images/n01_1.png"), 2);
        touch_image(&root.join("train/n01/images/n01_0.png"), 3);
        std::fs::write(root.join("train/n01/n01_boxes.txt"), "boxes").unwrap();
        touch_image(&root.join("val/images/val_0.png"), 4);
        std::fs::write(
            root.join("val/val_annotations.txt"),
            "val_0.png\tn02\t0\t0\t1\t1\n",
        )
        .unwrap();

        let classes = class_index(root).unwrap();
        assert_eq!(classes["n01"], 0);
        assert_eq!(classes["n02"], 1);

        let train = train_records(root, &classes).unwrap();
        let names: Vec<_> = train
            .iter()
            .map(|r| r.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["n01_0.png", "n01_1.png", "n02_1.png"]);
        assert_eq!(
            train.iter().map(|r| r.label).collect::<Vec<_>>(),
            vec![0, 0, 1]
        );

        let val = val_records(root, &classes).unwrap();
        assert_eq!(val.len(), 1);
        assert_eq!(val[0].label, 1);

        let pixels = load_image(&val[0].path, ImageShape::new(2, 2, 3)).unwrap();
        assert_eq!(pixels, vec![4u8; 12]);
        assert!(load_image(&val[0].path, ImageShape::new(4, 4, 3)).is_err());
    }

    #[test]
    fn test_unknown_val_class() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("train/n01")).unwrap();
        std::fs::create_dir_all(root.join("val")).unwrap();
        std::fs::write(root.join("val/val_annotations.txt"), "a.png\tn99\n").unwrap();
        let classes = class_index(root).unwrap();
        assert!(val_records(root, &classes).is_err());
    }
}
