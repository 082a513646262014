// src/process.rs

//! Batch preprocessing of a downsampled ImageNet variant: load, normalize, save, optionally whiten.

use crate::dataset::{load_batch, write_npz, DatasetKind, ImageSet};
use crate::diagnostics::compute_whiteness_error;
use crate::normalize::{normalize_samples, DEFAULT_NORMALIZE_EPS};
use crate::whitening::{Whitener, WhiteningConfig, WhiteningMode};
use log::{debug, info, warn};
use ndarray::{s, Array2, ArrayView4, Axis, ShapeError};
use rayon::prelude::*;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use sysinfo::System;

/// Settings for one preprocessing run.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Root holding the raw dataset directory (for example `<data_dir>/imagenet32`).
    pub data_dir: PathBuf,
    /// Created by the run; an existing directory makes the run a no-op.
    pub output_dir: PathBuf,
    pub dataset: DatasetKind,
    /// Per-sample standard deviation floor used by the normalizer.
    pub eps: f32,
    /// Deflate the arrays inside the `.npz` containers.
    pub compressed: bool,
    /// Whiten the normalized data as well. `None` skips the whitening stage.
    pub whitening: Option<WhiteningConfig>,
    /// Samples per block when applying the whitening matrix.
    pub transform_chunk_size: usize,
}

impl ProcessConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            output_dir: PathBuf::from("proc"),
            dataset: DatasetKind::Imagenet32,
            eps: DEFAULT_NORMALIZE_EPS,
            compressed: true,
            whitening: None,
            transform_chunk_size: 8192,
        }
    }
}

/// Result of [`Preprocessor::run`].
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The output directory already existed; nothing was touched.
    Skipped { output_dir: PathBuf },
    /// Files written, in order.
    Completed { written: Vec<PathBuf> },
}

/// Owns the configuration of a run and carries it through every stage.
#[derive(Debug)]
pub struct Preprocessor {
    config: ProcessConfig,
}

impl Preprocessor {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Runs the whole pipeline.
    ///
    /// The output directory is only created once the inputs are loaded, and is removed
    /// again if writing or whitening fails.
    ///
    /// # Errors
    /// Fails fast when the data directory or any batch file is missing, when a batch is
    /// malformed, when the whitening fit is not possible, or on any I/O error.
    pub fn run(&self) -> Result<ProcessOutcome, Box<dyn Error>> {
        let config = &self.config;
        if config.transform_chunk_size == 0 {
            return Err("transform_chunk_size must be at least 1.".into());
        }
        if !config.data_dir.exists() {
            return Err(
                format!("Data directory does not exist: {}", config.data_dir.display()).into(),
            );
        }
        let raw_dir = config.dataset.raw_dir(&config.data_dir);
        if !raw_dir.exists() {
            return Err(format!(
                "Raw {} batches not found at {}; download the dataset first.",
                config.dataset,
                raw_dir.display()
            )
            .into());
        }
        if config.output_dir.exists() {
            info!(
                "Found existing output at {}; delete it to run again.",
                config.output_dir.display()
            );
            return Ok(ProcessOutcome::Skipped { output_dir: config.output_dir.clone() });
        }
        let run_start_time = Instant::now();
        let (mut train, mut test) = self.load()?;
        normalize_samples(&mut train.images, config.eps)?;
        normalize_samples(&mut test.images, config.eps)?;

        fs::create_dir_all(&config.output_dir)
            .map_err(|e| format!("Failed to create {}: {}", config.output_dir.display(), e))?;
        // A partial output directory would make every later run skip.
        let written = match self.write_outputs(&train, &test) {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&config.output_dir) {
                    warn!(
                        "Failed to remove incomplete output {}: {}",
                        config.output_dir.display(),
                        cleanup
                    );
                }
                return Err(e);
            }
        };

        info!("Finished processing {} in {:?}", config.dataset, run_start_time.elapsed());
        Ok(ProcessOutcome::Completed { written })
    }

    fn write_outputs(
        &self,
        train: &ImageSet,
        test: &ImageSet,
    ) -> Result<Vec<PathBuf>, Box<dyn Error>> {
        let config = &self.config;
        let prefix = config.dataset.name();
        let train_path = config.output_dir.join(format!("{}-train.npz", prefix));
        let test_path = config.output_dir.join(format!("{}-test.npz", prefix));
        write_npz(&train_path, &train.images, &train.labels, config.compressed)?;
        write_npz(&test_path, &test.images, &test.labels, config.compressed)?;
        let mut written = vec![train_path, test_path];

        if let Some(whitening) = &config.whitening {
            written.extend(self.whiten(train, test, whitening)?);
        } else {
            debug!("Whitening disabled; skipping.");
        }
        Ok(written)
    }

    fn load(&self) -> Result<(ImageSet, ImageSet), Box<dyn Error>> {
        let config = &self.config;
        let load_start_time = Instant::now();
        info!("Loading {} from {}", config.dataset, config.data_dir.display());

        let batches = config
            .dataset
            .train_batch_paths(&config.data_dir)
            .iter()
            .map(|path| load_batch(path, config.dataset))
            .collect::<Result<Vec<_>, _>>()?;
        let train = ImageSet::concatenate(&batches)?;
        drop(batches);
        let test = load_batch(&config.dataset.val_path(&config.data_dir), config.dataset)?;

        info!(
            "Loaded {} train and {} test images in {:?}",
            train.len(),
            test.len(),
            load_start_time.elapsed()
        );
        Ok((train, test))
    }

    fn whiten(
        &self,
        train: &ImageSet,
        test: &ImageSet,
        whitening: &WhiteningConfig,
    ) -> Result<Vec<PathBuf>, Box<dyn Error>> {
        let config = &self.config;
        info!("Whitening ({:?}, strategy={})", whitening.mode, whitening.strategy);

        let fit_subset = whitening.fit_subset(train.len());
        let fit_samples = fit_subset.as_ref().map_or(train.len(), Vec::len);
        warn_if_fit_exceeds_memory(train.n_features(), fit_samples);

        let train_features = match &fit_subset {
            Some(indices) => flatten_to_features(train.images.select(Axis(0), indices).view())?,
            None => flatten_to_features(train.images.view())?,
        };
        let n_components = whitening.n_components.unwrap_or(train.n_features());
        let whitener =
            Whitener::fit_with_strategy(train_features.view(), n_components, whitening.strategy)?;
        drop(train_features);

        let w = whitener.whitening_matrix(whitening.mode, whitening.regularizer)?;
        let chunk = config.transform_chunk_size;
        let transform_start_time = Instant::now();
        let train_out = transform_in_chunks(&whitener, &w, train.images.view(), chunk)?;
        let test_out = transform_in_chunks(&whitener, &w, test.images.view(), chunk)?;
        info!("Applied whitening to train and test in {:?}", transform_start_time.elapsed());

        if log::log_enabled!(log::Level::Debug) {
            let head = train_out.slice(s![..train_out.nrows().min(10_000), ..]);
            let probe = head.t().mapv(f64::from);
            if let Some(err) = compute_whiteness_error(&probe.view()) {
                debug!("Whiteness error ||cov - I||_F on train output: {:.3e}", err);
            }
        }

        let prefix = config.dataset.name();
        let train_path = config.output_dir.join(format!("{}-train-proc.npz", prefix));
        let test_path = config.output_dir.join(format!("{}-test-proc.npz", prefix));
        self.write_whitened(&train_path, train_out, train, whitening.mode)?;
        self.write_whitened(&test_path, test_out, test, whitening.mode)?;
        Ok(vec![train_path, test_path])
    }

    /// ZCA output keeps the input layout and is stored as images; other modes as
    /// (samples, components).
    fn write_whitened(
        &self,
        path: &Path,
        output: Array2<f32>,
        source: &ImageSet,
        mode: WhiteningMode,
    ) -> Result<(), Box<dyn Error>> {
        if mode == WhiteningMode::Zca {
            let images = output.into_shape_with_order(source.images.raw_dim())?;
            write_npz(path, &images, &source.labels, self.config.compressed)
        } else {
            write_npz(path, &output, &source.labels, self.config.compressed)
        }
    }
}

/// Flattens (samples, c, h, w) images into a (features, samples) `f64` matrix.
pub fn flatten_to_features(images: ArrayView4<f32>) -> Result<Array2<f64>, ShapeError> {
    let n_samples = images.len_of(Axis(0));
    let n_features: usize = images.shape()[1..].iter().product();
    let flat = images.to_shape((n_samples, n_features))?;
    Ok(flat.t().mapv(f64::from))
}

/// Applies `w (x - m)` to blocks of samples in parallel.
///
/// Returns a (samples, w.nrows()) matrix in `f32`.
fn transform_in_chunks(
    whitener: &Whitener,
    w: &Array2<f64>,
    images: ArrayView4<f32>,
    chunk: usize,
) -> Result<Array2<f32>, ShapeError> {
    let n_samples = images.len_of(Axis(0));
    let mut output = Array2::<f32>::zeros((n_samples, w.nrows()));
    output
        .axis_chunks_iter_mut(Axis(0), chunk)
        .into_par_iter()
        .zip(images.axis_chunks_iter(Axis(0), chunk).into_par_iter())
        .try_for_each(|(mut out_block, image_block)| {
            let features = flatten_to_features(image_block)?;
            let transformed = whitener.apply(w, features.view());
            out_block.assign(&transformed.t().mapv(|v| v as f32));
            Ok(())
        })?;
    Ok(output)
}

fn warn_if_fit_exceeds_memory(n_features: usize, n_samples: usize) {
    // f64 feature matrix, its centered copy and the decomposition workspace.
    let estimated_bytes = (n_features as u64) * (n_samples as u64) * 8 * 3;
    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();
    debug!(
        "Whitening fit needs roughly {} MiB; {} MiB available.",
        estimated_bytes >> 20,
        available >> 20
    );
    if available > 0 && estimated_bytes > available {
        warn!(
            "Whitening fit on {} samples x {} features may need ~{} MiB but only {} MiB is \
             available; consider max_fit_samples.",
            n_samples,
            n_features,
            estimated_bytes >> 20,
            available >> 20
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn flatten_puts_samples_in_columns() {
        let images = Array4::from_shape_fn((2, 3, 2, 2), |(n, c, h, w)| {
            (n * 100 + c * 4 + h * 2 + w) as f32
        });
        let features = flatten_to_features(images.view()).unwrap();
        assert_eq!(features.dim(), (12, 2));
        assert_eq!(features[[0, 1]], 100.0);
        assert_eq!(features[[5, 0]], 5.0);
        assert_eq!(features[[11, 1]], 111.0);
    }

    #[test]
    fn chunked_transform_matches_whole_transform() {
        let images = Array4::from_shape_fn((23, 3, 2, 2), |(n, c, h, w)| {
            ((n * 31 + c * 7 + h * 3 + w * 11) % 17) as f32 - 8.0
        });
        let features = flatten_to_features(images.view()).unwrap();
        let whitener = Whitener::fit(features.view(), 12).unwrap();
        let w = whitener.whitening_matrix(WhiteningMode::Zca, 1e-5).unwrap();

        let whole = whitener.transform(features.view(), WhiteningMode::Zca, 1e-5).unwrap();
        for chunk in [1, 5, 23, 100] {
            let chunked = transform_in_chunks(&whitener, &w, images.view(), chunk).unwrap();
            assert_eq!(chunked.dim(), (23, 12));
            for (a, b) in chunked.iter().zip(whole.t().iter()) {
                assert!((*a as f64 - b).abs() < 1e-3 * b.abs().max(1.0), "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let mut config = ProcessConfig::new(".");
        config.transform_chunk_size = 0;
        assert!(Preprocessor::new(config).run().is_err());
    }
}
