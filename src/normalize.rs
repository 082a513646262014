// src/normalize.rs

//! Per-sample standardization of image batches.

use log::{debug, info};
use ndarray::{Array, ArrayBase, Axis, Data, Dimension, RemoveAxis};
use rayon::prelude::*;
use std::error::Error;

/// Standard deviations below this are treated as a constant sample.
pub const DEFAULT_NORMALIZE_EPS: f32 = 1e-8;

/// Standardizes each sample (index along axis 0) in place.
///
/// Every sample has its mean over all remaining axes subtracted and is divided by its
/// Bessel-corrected (`n - 1`) standard deviation. A standard deviation below `eps` is
/// replaced by `1.0`, so a constant sample becomes all zeros. Samples holding a single
/// value have no sample variance and are only centered.
///
/// Samples are processed in parallel; there is no coupling between them.
///
/// # Errors
/// Returns an error for a zero-dimensional array or an `eps` that is not strictly positive
/// and finite.
pub fn normalize_samples<D>(data: &mut Array<f32, D>, eps: f32) -> Result<(), Box<dyn Error>>
where
    D: Dimension + RemoveAxis,
{
    if data.ndim() == 0 {
        return Err("Cannot normalize a zero-dimensional array: axis 0 must index samples.".into());
    }
    if !eps.is_finite() || eps <= 0.0 {
        return Err(format!("eps must be a finite, strictly positive value, got {}.", eps).into());
    }

    let n_samples = data.len_of(Axis(0));
    let values_per_sample = if n_samples == 0 { 0 } else { data.len() / n_samples };
    info!(
        "Normalizing {} samples ({} values each).",
        n_samples, values_per_sample
    );

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut sample| {
            let count = sample.len();
            if count == 0 {
                return;
            }
            let mean_f64 = sample.iter().map(|&v| v as f64).sum::<f64>() / count as f64;
            let mean = mean_f64 as f32;
            sample.mapv_inplace(|v| v - mean);

            let std_dev = if count > 1 {
                let sum_sq = sample.iter().map(|&v| (v as f64).powi(2)).sum::<f64>();
                (sum_sq / (count as f64 - 1.0)).sqrt() as f32
            } else {
                1.0
            };
            if std_dev >= eps {
                sample.mapv_inplace(|v| v / std_dev);
            }
        });

    debug!("Finished per-sample normalization.");
    Ok(())
}

/// Returns a standardized copy of `data`, leaving the input untouched.
pub fn normalized<S, D>(data: &ArrayBase<S, D>, eps: f32) -> Result<Array<f32, D>, Box<dyn Error>>
where
    S: Data<Elem = f32>,
    D: Dimension + RemoveAxis,
{
    let mut owned = data.to_owned();
    normalize_samples(&mut owned, eps)?;
    Ok(owned)
}
