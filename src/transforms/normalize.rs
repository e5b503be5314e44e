//! Per-volume intensity normalization.

use crate::error::{Error, Result};
use ndarray::{Array, ArrayBase, Data, Dimension};
use rayon::prelude::*;

/// Mean and population standard deviation of a volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeStats {
    /// Arithmetic mean.
    pub mean: f64,
    /// Standard deviation with ddof = 0.
    pub std: f64,
}

/// Compute mean and standard deviation, accumulating in `f64`.
pub fn volume_stats<S, D>(volume: &ArrayBase<S, D>) -> VolumeStats
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let n = volume.len().max(1) as f64;
    let (mean, sum_sq_dev) = match volume.as_slice_memory_order() {
        Some(slice) => {
            let mean = slice.par_iter().map(|&v| f64::from(v)).sum::<f64>() / n;
            let dev = slice
                .par_iter()
                .map(|&v| (f64::from(v) - mean).powi(2))
                .sum::<f64>();
            (mean, dev)
        }
        None => {
            let mean = volume.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
            let dev = volume
                .iter()
                .map(|&v| (f64::from(v) - mean).powi(2))
                .sum::<f64>();
            (mean, dev)
        }
    };

    VolumeStats {
        mean,
        std: (sum_sq_dev / n).sqrt(),
    }
}

/// Rescale a volume to zero mean and unit variance: `(v - mean) / std`.
///
/// Statistics cover the whole volume. Returns [`Error::DegenerateVolume`]
/// when the standard deviation is zero or not finite.
#[must_use = "this function returns a new volume and does not modify the original"]
pub fn normalize<S, D>(volume: &ArrayBase<S, D>) -> Result<Array<f32, D>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    if volume.is_empty() {
        return Err(Error::DegenerateVolume("volume has no voxels".to_string()));
    }

    let VolumeStats { mean, std } = volume_stats(volume);
    if !(std.is_finite() && std > 0.0) {
        return Err(Error::DegenerateVolume(format!(
            "standard deviation is {std} (mean {mean})"
        )));
    }

    Ok(volume.mapv(|v| ((f64::from(v) - mean) / std) as f32))
}
