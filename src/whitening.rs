// src/whitening.rs

//! PCA and ZCA whitening of a features x samples data matrix.

use crate::diagnostics::compute_orthogonality_error;
use crate::linalg_backends::{BackendEigh, BackendSVD, LinAlgBackendProvider};
use log::{debug, info};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

/// Smoothing added to every singular value before it is inverted.
pub const DEFAULT_REGULARIZER: f64 = 1e-5;

/// How `transform` maps centered data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WhiteningMode {
    /// `U^T (D - m)`: rotate onto the principal directions only.
    Decorrelate,
    /// `diag(1/(S + r)) U^T (D - m)`: unit variance along each direction.
    Pca,
    /// `U diag(1/(S + r)) U^T (D - m)`: whitened, then rotated back into the input basis.
    #[default]
    Zca,
}

impl WhiteningMode {
    /// Maps the `whiten`/`zca` flag pair onto a mode. `zca` is ignored unless `whiten` is set.
    pub fn from_flags(whiten: bool, zca: bool) -> Self {
        match (whiten, zca) {
            (false, _) => WhiteningMode::Decorrelate,
            (true, false) => WhiteningMode::Pca,
            (true, true) => WhiteningMode::Zca,
        }
    }

    pub fn whitens(self) -> bool {
        !matches!(self, WhiteningMode::Decorrelate)
    }
}

/// Decomposition used to obtain the principal directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FitStrategy {
    /// Thin SVD of the centered, scaled data.
    #[default]
    Svd,
    /// Eigendecomposition of the features x features covariance matrix.
    /// Same directions and scales; much cheaper when samples far outnumber features.
    Covariance,
}

impl FromStr for FitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "svd" => Ok(FitStrategy::Svd),
            "covariance" | "cov" => Ok(FitStrategy::Covariance),
            other => Err(format!(
                "unknown fit strategy '{}' (expected one of: svd, covariance)",
                other
            )),
        }
    }
}

impl fmt::Display for FitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitStrategy::Svd => write!(f, "svd"),
            FitStrategy::Covariance => write!(f, "covariance"),
        }
    }
}

/// Parameters for fitting and applying a [`Whitener`].
#[derive(Clone, Debug)]
pub struct WhiteningConfig {
    /// Number of principal directions to keep. `None` keeps one per feature.
    pub n_components: Option<usize>,
    /// Added to each singular value before inversion. Must be strictly positive.
    pub regularizer: f64,
    pub mode: WhiteningMode,
    pub strategy: FitStrategy,
    /// Fit on at most this many samples, drawn uniformly without replacement.
    pub max_fit_samples: Option<usize>,
    /// Seed for the sample subset.
    pub seed: u64,
}

impl WhiteningConfig {
    /// Sorted indices of the samples to fit on, or `None` when every sample is used.
    pub fn fit_subset(&self, n_samples: usize) -> Option<Vec<usize>> {
        let limit = self.max_fit_samples.filter(|&limit| limit < n_samples)?;
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut chosen = rand::seq::index::sample(&mut rng, n_samples, limit).into_vec();
        chosen.sort_unstable();
        debug!("Fitting on {} of {} samples (seed {}).", limit, n_samples, self.seed);
        Some(chosen)
    }
}

impl Default for WhiteningConfig {
    fn default() -> Self {
        Self {
            n_components: None,
            regularizer: DEFAULT_REGULARIZER,
            mode: WhiteningMode::Zca,
            strategy: FitStrategy::Svd,
            max_fit_samples: None,
            seed: 42,
        }
    }
}

/// Fitted whitening model.
///
/// Holds the principal directions `U` (features x n_components), the matching
/// scales `S` (non-negative, non-increasing) and the per-feature mean `m`.
/// The model never changes after construction.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Whitener {
    components: Array2<f64>,
    singular_values: Array1<f64>,
    mean: Array1<f64>,
}

impl Whitener {
    /// Fits the model with a thin SVD of the centered data scaled by `1/sqrt(samples - 1)`.
    ///
    /// * `data` - shape (n_features, n_samples). Only borrowed; the decomposition runs on
    ///   a scoped copy, so the caller's array is never modified.
    /// * `n_components` - number of directions to keep, `1..=min(n_features, n_samples)`.
    ///
    /// # Errors
    /// Returns an error if the matrix has no features or fewer than 2 samples, if it contains
    /// non-finite values, if `n_components` is out of range, or if the decomposition fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use ndarray::array;
    /// use batch_whitening::Whitener;
    ///
    /// let data = array![[1.0, 2.0, 4.0], [0.5, 0.1, 0.9]];
    /// let whitener = Whitener::fit(data.view(), 2).unwrap();
    /// assert_eq!(whitener.components().dim(), (2, 2));
    /// ```
    pub fn fit(data: ArrayView2<f64>, n_components: usize) -> Result<Self, Box<dyn Error>> {
        Self::fit_with_strategy(data, n_components, FitStrategy::Svd)
    }

    /// Same contract as [`Whitener::fit`], choosing the decomposition explicitly.
    pub fn fit_with_strategy(
        data: ArrayView2<f64>,
        n_components: usize,
        strategy: FitStrategy,
    ) -> Result<Self, Box<dyn Error>> {
        let (n_features, n_samples) = data.dim();

        if n_features == 0 {
            return Err("Input data has zero features.".into());
        }
        if n_samples < 2 {
            return Err(
                format!("Input data must have at least 2 samples, got {}.", n_samples).into(),
            );
        }
        let max_components = n_features.min(n_samples);
        if n_components == 0 || n_components > max_components {
            return Err(format!(
                "n_components ({}) must be between 1 and min(n_features, n_samples) = {}.",
                n_components, max_components
            )
            .into());
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err("Input data contains non-finite (NaN or infinity) values.".into());
        }

        let fit_start_time = Instant::now();
        info!(
            "Fitting whitening model ({} features, {} samples, {} components, strategy={}).",
            n_features, n_samples, n_components, strategy
        );

        let mean = data
            .mean_axis(Axis(1))
            .ok_or("Failed to compute mean of the data.")?;

        // Y = (D - m) / sqrt(n - 1), so Y Y^T is the sample covariance.
        let mut scaled = &data - &mean.view().insert_axis(Axis(1));
        scaled *= 1.0 / ((n_samples - 1) as f64).sqrt();

        let (components, singular_values) = match strategy {
            FitStrategy::Svd => top_directions_by_svd(scaled, n_components)?,
            FitStrategy::Covariance => top_directions_by_covariance(scaled, n_components)?,
        };

        if let Some(err) = compute_orthogonality_error(&components.view()) {
            debug!("Orthogonality error of fitted directions: {:.3e}", err);
        }
        info!("Fitted whitening model in {:?}", fit_start_time.elapsed());

        Ok(Self { components, singular_values, mean })
    }

    /// Fits according to a [`WhiteningConfig`], drawing a seeded sample subset when
    /// `max_fit_samples` is smaller than the number of samples.
    pub fn fit_with_config(
        data: ArrayView2<f64>,
        config: &WhiteningConfig,
    ) -> Result<Self, Box<dyn Error>> {
        let n_components = config.n_components.unwrap_or(data.nrows());
        match config.fit_subset(data.ncols()) {
            Some(indices) => {
                let subset = data.select(Axis(1), &indices);
                Self::fit_with_strategy(subset.view(), n_components, config.strategy)
            }
            None => Self::fit_with_strategy(data, n_components, config.strategy),
        }
    }

    /// Builds a model from previously computed parts.
    ///
    /// # Errors
    /// Returns an error if the shapes disagree, values are non-finite, or the singular
    /// values are negative or not in non-increasing order.
    pub fn with_model(
        components: Array2<f64>,
        singular_values: Array1<f64>,
        mean: Array1<f64>,
    ) -> Result<Self, Box<dyn Error>> {
        let model = Self { components, singular_values, mean };
        model.validate()?;
        Ok(model)
    }

    /// Principal directions `U`, shape (n_features, n_components).
    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    /// Scales `S`, one per direction.
    pub fn singular_values(&self) -> &Array1<f64> {
        &self.singular_values
    }

    /// Per-feature mean `m` of the fitting data.
    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn n_features(&self) -> usize {
        self.components.nrows()
    }

    pub fn n_components(&self) -> usize {
        self.components.ncols()
    }

    /// Number of output rows produced by `transform` in `mode`.
    pub fn output_dim(&self, mode: WhiteningMode) -> usize {
        match mode {
            WhiteningMode::Zca => self.n_features(),
            WhiteningMode::Decorrelate | WhiteningMode::Pca => self.n_components(),
        }
    }

    /// Builds the linear map `W` applied to centered data.
    ///
    /// `regularizer` is only read by the whitening modes.
    pub fn whitening_matrix(
        &self,
        mode: WhiteningMode,
        regularizer: f64,
    ) -> Result<Array2<f64>, Box<dyn Error>> {
        if !mode.whitens() {
            return Ok(self.components.t().to_owned());
        }
        if !regularizer.is_finite() || regularizer <= 0.0 {
            return Err(format!(
                "regularizer must be strictly positive and finite, got {}.",
                regularizer
            )
            .into());
        }

        let inv_scales = self.singular_values.mapv(|s| 1.0 / (s + regularizer));
        // diag(S^-1) U^T, scaling row i of U^T by inv_scales[i]
        let scaled_basis = &self.components.t() * &inv_scales.view().insert_axis(Axis(1));
        match mode {
            WhiteningMode::Pca => Ok(scaled_basis),
            _ => Ok(self.components.dot(&scaled_basis)),
        }
    }

    /// Applies the model to `data` (n_features, n_samples). `data` is not modified.
    ///
    /// Output shape is (n_components, n_samples), or (n_features, n_samples) for
    /// [`WhiteningMode::Zca`].
    ///
    /// # Errors
    /// Returns an error on a feature-count mismatch or an invalid regularizer.
    pub fn transform(
        &self,
        data: ArrayView2<f64>,
        mode: WhiteningMode,
        regularizer: f64,
    ) -> Result<Array2<f64>, Box<dyn Error>> {
        if data.nrows() != self.n_features() {
            return Err(format!(
                "Input data feature dimension ({}) does not match model's feature dimension ({}).",
                data.nrows(),
                self.n_features()
            )
            .into());
        }
        let w = self.whitening_matrix(mode, regularizer)?;
        if data.ncols() == 0 {
            return Ok(Array2::zeros((w.nrows(), 0)));
        }
        Ok(self.apply(&w, data))
    }

    /// Computes `w (data - m)` for a whitening matrix from [`Whitener::whitening_matrix`].
    pub(crate) fn apply(&self, w: &Array2<f64>, data: ArrayView2<f64>) -> Array2<f64> {
        let centered = &data - &self.mean.view().insert_axis(Axis(1));
        w.dot(&centered)
    }

    /// Saves the model with bincode.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        let file = File::create(path.as_ref())
            .map_err(|e| format!("Failed to create file at {:?}: {}", path.as_ref(), e))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| format!("Failed to serialize whitening model: {}", e))?;
        Ok(())
    }

    /// Loads a model written by [`Whitener::save_model`] and validates it.
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let file = File::open(path.as_ref())
            .map_err(|e| format!("Failed to open file at {:?}: {}", path.as_ref(), e))?;
        let mut reader = BufReader::new(file);
        let model: Whitener =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| format!("Failed to deserialize whitening model: {}", e))?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), Box<dyn Error>> {
        let (n_features, n_components) = self.components.dim();
        if n_features == 0 || n_components == 0 {
            return Err("Whitening model must have at least one feature and one component.".into());
        }
        if self.mean.len() != n_features {
            return Err(format!(
                "Mean length ({}) does not match the components' feature dimension ({}).",
                self.mean.len(),
                n_features
            )
            .into());
        }
        if self.singular_values.len() != n_components {
            return Err(format!(
                "Singular value count ({}) does not match the number of components ({}).",
                self.singular_values.len(),
                n_components
            )
            .into());
        }
        let all_finite = self
            .components
            .iter()
            .chain(self.singular_values.iter())
            .chain(self.mean.iter())
            .all(|v| v.is_finite());
        if !all_finite {
            return Err("Whitening model contains non-finite values.".into());
        }
        if self.singular_values.iter().any(|&s| s < 0.0) {
            return Err("Singular values must be non-negative.".into());
        }
        if self.singular_values.windows(2).into_iter().any(|w| w[1] > w[0]) {
            return Err("Singular values must be in non-increasing order.".into());
        }
        Ok(())
    }
}

fn top_directions_by_svd(
    scaled: Array2<f64>,
    n_components: usize,
) -> Result<(Array2<f64>, Array1<f64>), Box<dyn Error>> {
    let backend = LinAlgBackendProvider::<f64>::new();
    let svd = backend
        .svd_into(scaled, true, false)
        .map_err(|e| format!("SVD of the centered data failed: {}", e))?;
    let u = svd.u.ok_or("SVD did not return left singular vectors.")?;
    if u.ncols() < n_components || svd.s.len() < n_components {
        return Err(format!(
            "SVD returned {} directions, fewer than the {} requested.",
            svd.s.len(),
            n_components
        )
        .into());
    }
    let components = u.slice(s![.., ..n_components]).to_owned();
    let singular_values = svd.s.slice(s![..n_components]).mapv(|v| v.max(0.0));
    Ok((components, singular_values))
}

fn top_directions_by_covariance(
    scaled: Array2<f64>,
    n_components: usize,
) -> Result<(Array2<f64>, Array1<f64>), Box<dyn Error>> {
    let covariance = scaled.dot(&scaled.t());
    drop(scaled);

    let backend = LinAlgBackendProvider::<f64>::new();
    let eig = backend
        .eigh_upper(&covariance)
        .map_err(|e| format!("Eigen decomposition of covariance matrix failed: {}", e))?;

    // eigh yields ascending eigenvalues; sort descending to match SVD ordering.
    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .partial_cmp(&eig.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(n_components);

    let components = eig.eigenvectors.select(Axis(1), &order);
    let singular_values = order
        .iter()
        .map(|&i| eig.eigenvalues[i].max(0.0).sqrt())
        .collect::<Array1<f64>>();
    Ok((components, singular_values))
}
