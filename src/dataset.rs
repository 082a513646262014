// src/dataset.rs

//! Downsampled ImageNet batches and the .npz container used for inputs and outputs.

use log::{debug, info};
use ndarray::{concatenate, Array1, Array2, Array4, ArrayBase, ArrayD, Axis, Data, Dimension, Ix4};
use ndarray_npy::{NpzReader, NpzWriter};
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Number of `train_data_batch_*` files in every downsampled ImageNet variant.
pub const TRAIN_BATCH_COUNT: usize = 10;
/// Colour channels per image.
pub const CHANNELS: usize = 3;

const DATA_KEY: &str = "data";
const LABELS_KEY: &str = "labels";

/// The datasets this crate knows how to process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    Imagenet8,
    Imagenet16,
    Imagenet32,
    Imagenet64,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 4] = [
        DatasetKind::Imagenet8,
        DatasetKind::Imagenet16,
        DatasetKind::Imagenet32,
        DatasetKind::Imagenet64,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DatasetKind::Imagenet8 => "imagenet8",
            DatasetKind::Imagenet16 => "imagenet16",
            DatasetKind::Imagenet32 => "imagenet32",
            DatasetKind::Imagenet64 => "imagenet64",
        }
    }

    /// Image height and width in pixels.
    pub fn side(self) -> usize {
        match self {
            DatasetKind::Imagenet8 => 8,
            DatasetKind::Imagenet16 => 16,
            DatasetKind::Imagenet32 => 32,
            DatasetKind::Imagenet64 => 64,
        }
    }

    /// Flattened values per image (`3 * side * side`).
    pub fn n_features(self) -> usize {
        CHANNELS * self.side() * self.side()
    }

    /// Directory under the data root holding the raw batches.
    pub fn raw_dir(self, data_root: &Path) -> PathBuf {
        data_root.join(self.name())
    }

    pub fn train_batch_paths(self, data_root: &Path) -> Vec<PathBuf> {
        let raw = self.raw_dir(data_root);
        (1..=TRAIN_BATCH_COUNT)
            .map(|i| raw.join(format!("train_data_batch_{}.npz", i)))
            .collect()
    }

    pub fn val_path(self, data_root: &Path) -> PathBuf {
        self.raw_dir(data_root).join("val_data.npz")
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatasetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        DatasetKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == key)
            .ok_or_else(|| {
                let known: Vec<&str> = DatasetKind::ALL.iter().map(|k| k.name()).collect();
                format!("unknown dataset '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

/// Images with shape (samples, channels, height, width) and their 0-based class labels.
#[derive(Clone, Debug)]
pub struct ImageSet {
    pub images: Array4<f32>,
    pub labels: Array1<i64>,
}

impl ImageSet {
    pub fn new(images: Array4<f32>, labels: Array1<i64>) -> Result<Self, Box<dyn Error>> {
        if images.len_of(Axis(0)) != labels.len() {
            return Err(format!(
                "Image count ({}) does not match label count ({}).",
                images.len_of(Axis(0)),
                labels.len()
            )
            .into());
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Values per image.
    pub fn n_features(&self) -> usize {
        self.images.shape()[1..].iter().product()
    }

    /// Stacks several sets along the sample axis, preserving order.
    pub fn concatenate(sets: &[ImageSet]) -> Result<ImageSet, Box<dyn Error>> {
        if sets.is_empty() {
            return Err("Cannot concatenate an empty list of image sets.".into());
        }
        let image_views: Vec<_> = sets.iter().map(|set| set.images.view()).collect();
        let label_views: Vec<_> = sets.iter().map(|set| set.labels.view()).collect();
        let images = concatenate(Axis(0), &image_views)
            .map_err(|e| format!("Image batches have incompatible shapes: {}", e))?;
        let labels = concatenate(Axis(0), &label_views)?;
        ImageSet::new(images, labels)
    }
}

/// Reads one raw batch: `data` as u8 (samples, 3*side*side) and 1-based `labels`.
///
/// Pixels are converted to `f32` and reshaped to (samples, 3, side, side); labels are
/// shifted to start at 0.
pub fn load_batch(path: &Path, kind: DatasetKind) -> Result<ImageSet, Box<dyn Error>> {
    if !path.exists() {
        return Err(format!("Batch file does not exist: {}", path.display()).into());
    }
    let file = File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    let mut npz = NpzReader::new(file)
        .map_err(|e| format!("Failed to read {} as npz: {}", path.display(), e))?;

    let raw: Array2<u8> = npz
        .by_name(DATA_KEY)
        .map_err(|e| format!("Failed to read '{}' from {}: {}", DATA_KEY, path.display(), e))?;
    let raw_labels = read_labels(&mut npz)
        .map_err(|e| format!("Failed to read '{}' from {}: {}", LABELS_KEY, path.display(), e))?;

    let (n_samples, n_values) = raw.dim();
    if n_values != kind.n_features() {
        return Err(format!(
            "{} holds {} values per image, expected {} for {}.",
            path.display(),
            n_values,
            kind.n_features(),
            kind
        )
        .into());
    }
    if let Some(&bad) = raw_labels.iter().find(|&&label| label < 1) {
        return Err(format!(
            "{} contains label {}; raw labels must start at 1.",
            path.display(),
            bad
        )
        .into());
    }

    let side = kind.side();
    let images = raw
        .mapv(f32::from)
        .into_shape_with_order((n_samples, CHANNELS, side, side))?;
    let labels = raw_labels.mapv(|label| label - 1);
    debug!("Loaded {} images from {}", n_samples, path.display());
    ImageSet::new(images, labels)
}

/// Labels are stored as int64 by NumPy on most platforms but int32 on some.
fn read_labels(npz: &mut NpzReader<File>) -> Result<Array1<i64>, Box<dyn Error>> {
    match npz.by_name::<ndarray::OwnedRepr<i64>, ndarray::Ix1>(LABELS_KEY) {
        Ok(labels) => Ok(labels),
        Err(_) => {
            let labels: Array1<i32> = npz.by_name(LABELS_KEY)?;
            Ok(labels.mapv(i64::from))
        }
    }
}

/// Writes `data` and `labels` as NumPy-compatible arrays named `data` and `labels`.
pub fn write_npz<S, D>(
    path: &Path,
    data: &ArrayBase<S, D>,
    labels: &Array1<i64>,
    compressed: bool,
) -> Result<(), Box<dyn Error>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let file =
        File::create(path).map_err(|e| format!("Failed to create {}: {}", path.display(), e))?;
    let mut npz = if compressed {
        NpzWriter::new_compressed(file)
    } else {
        NpzWriter::new(file)
    };
    npz.add_array(DATA_KEY, data)?;
    npz.add_array(LABELS_KEY, labels)?;
    npz.finish()?;
    info!("Wrote {} ({} samples)", path.display(), data.shape().first().copied().unwrap_or(0));
    Ok(())
}

/// Reads a file written by [`write_npz`].
pub fn read_npz(path: &Path) -> Result<(ArrayD<f32>, Array1<i64>), Box<dyn Error>> {
    let file = File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    let mut npz = NpzReader::new(file)?;
    let data: ArrayD<f32> = npz.by_name(DATA_KEY)?;
    let labels: Array1<i64> = npz.by_name(LABELS_KEY)?;
    Ok((data, labels))
}

/// Reads a processed image file back into an [`ImageSet`].
pub fn read_image_set(path: &Path) -> Result<ImageSet, Box<dyn Error>> {
    let (data, labels) = read_npz(path)?;
    let images = data
        .into_dimensionality::<Ix4>()
        .map_err(|e| format!("{} does not hold 4-D image data: {}", path.display(), e))?;
    ImageSet::new(images, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn registry_parses_known_names() {
        assert_eq!("imagenet32".parse::<DatasetKind>().unwrap(), DatasetKind::Imagenet32);
        assert_eq!(" ImageNet8 ".parse::<DatasetKind>().unwrap(), DatasetKind::Imagenet8);
        for kind in DatasetKind::ALL {
            assert_eq!(kind.name().parse::<DatasetKind>().unwrap(), kind);
        }
    }

    #[test]
    fn registry_rejects_unknown_names() {
        let err = "cifar10".parse::<DatasetKind>().unwrap_err();
        assert!(err.contains("cifar10"));
        assert!(err.contains("imagenet32"));
    }

    #[test]
    fn batch_paths_follow_raw_layout() {
        let root = Path::new("/data");
        let paths = DatasetKind::Imagenet32.train_batch_paths(root);
        assert_eq!(paths.len(), TRAIN_BATCH_COUNT);
        assert_eq!(paths[0], Path::new("/data/imagenet32/train_data_batch_1.npz"));
        assert_eq!(paths[9], Path::new("/data/imagenet32/train_data_batch_10.npz"));
        assert_eq!(
            DatasetKind::Imagenet32.val_path(root),
            Path::new("/data/imagenet32/val_data.npz")
        );
        assert_eq!(DatasetKind::Imagenet32.n_features(), 3072);
    }

    #[test]
    fn concatenate_keeps_sample_order() {
        let a = ImageSet::new(Array::zeros((2, 3, 2, 2)), Array1::from(vec![0, 1])).unwrap();
        let b = ImageSet::new(Array::ones((1, 3, 2, 2)), Array1::from(vec![7])).unwrap();
        let joined = ImageSet::concatenate(&[a, b]).unwrap();
        assert_eq!(joined.images.dim(), (3, 3, 2, 2));
        assert_eq!(joined.labels.to_vec(), vec![0, 1, 7]);
        assert_eq!(joined.images[[2, 0, 0, 0]], 1.0);
        assert_eq!(joined.n_features(), 12);
    }

    #[test]
    fn mismatched_label_count_is_rejected() {
        let result = ImageSet::new(Array::zeros((2, 3, 2, 2)), Array1::from(vec![0]));
        assert!(result.is_err());
    }

    #[test]
    fn load_batch_shifts_labels_and_reshapes() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("batch.npz");
        let kind = DatasetKind::Imagenet8;
        let raw = Array2::from_shape_fn((4, kind.n_features()), |(i, j)| ((i * 7 + j) % 256) as u8);
        {
            let mut npz = NpzWriter::new(File::create(&path)?);
            npz.add_array("data", &raw)?;
            npz.add_array("labels", &Array1::from(vec![1i64, 2, 1000, 5]))?;
            npz.finish()?;
        }

        let set = load_batch(&path, kind)?;
        assert_eq!(set.images.dim(), (4, 3, 8, 8));
        assert_eq!(set.labels.to_vec(), vec![0, 1, 999, 4]);
        assert_eq!(set.images[[1, 0, 0, 1]], raw[[1, 1]] as f32);
        assert_eq!(set.images[[3, 2, 7, 7]], raw[[3, kind.n_features() - 1]] as f32);
        Ok(())
    }

    #[test]
    fn load_batch_rejects_zero_based_labels() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("batch.npz");
        {
            let mut npz = NpzWriter::new(File::create(&path)?);
            npz.add_array("data", &Array2::<u8>::zeros((2, DatasetKind::Imagenet8.n_features())))?;
            npz.add_array("labels", &Array1::from(vec![0i32, 3]))?;
            npz.finish()?;
        }
        let err = load_batch(&path, DatasetKind::Imagenet8).unwrap_err();
        assert!(err.to_string().contains("must start at 1"));
        Ok(())
    }

    #[test]
    fn load_batch_rejects_wrong_resolution() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("batch.npz");
        {
            let mut npz = NpzWriter::new(File::create(&path)?);
            npz.add_array("data", &Array2::<u8>::zeros((2, DatasetKind::Imagenet16.n_features())))?;
            npz.add_array("labels", &Array1::from(vec![1i64, 3]))?;
            npz.finish()?;
        }
        assert!(load_batch(&path, DatasetKind::Imagenet8).is_err());
        Ok(())
    }

    #[test]
    fn written_images_read_back() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("set.npz");
        let set = ImageSet::new(
            Array::from_shape_fn((3, 3, 2, 2), |(n, c, h, w)| {
                (n * 100 + c * 10 + h * 2 + w) as f32 * 0.5
            }),
            Array1::from(vec![4, 0, 2]),
        )?;
        write_npz(&path, &set.images, &set.labels, true)?;
        let back = read_image_set(&path)?;
        assert_eq!(back.images, set.images);
        assert_eq!(back.labels, set.labels);
        Ok(())
    }

    #[test]
    fn missing_batch_file_is_reported() {
        let path = Path::new("/nonexistent/train_data_batch_1.npz");
        let err = load_batch(path, DatasetKind::Imagenet32).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
