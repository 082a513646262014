// Batch whitening (PCA / ZCA) and per-sample normalization

#![doc = include_str!("../README.md")]

pub mod dataset;
pub mod diagnostics;
pub mod linalg_backends;
pub mod normalize;
pub mod process;
pub mod whitening;


pub use dataset::{DatasetKind, ImageSet};
pub use normalize::{normalize_samples, normalized};
pub use process::{Preprocessor, ProcessConfig, ProcessOutcome};
pub use whitening::{FitStrategy, Whitener, WhiteningConfig, WhiteningMode, DEFAULT_REGULARIZER};
