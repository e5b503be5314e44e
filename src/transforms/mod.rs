//! Volume transforms applied during preprocessing and batch generation.
//!
//! Every transform returns a new array; inputs are never modified in place.

pub mod augment;
mod normalize;
mod resample;

pub use augment::{augment, AugmentParams, Augmenter};
pub use normalize::{normalize, volume_stats, VolumeStats};
pub use resample::{resample, resample_dyn, resample_nearest, resample_trilinear};

use ndarray::{ArrayBase, Data, Dimension};
use std::collections::BTreeMap;

/// Interpolation policy used when resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Copy the closest source voxel; use for label volumes.
    Nearest,
    /// Linear blend of the eight surrounding voxels.
    #[default]
    Trilinear,
}

/// Voxel count per label value.
pub fn label_histogram<S, D>(labels: &ArrayBase<S, D>) -> BTreeMap<u8, usize>
where
    S: Data<Elem = u8>,
    D: Dimension,
{
    let mut counts = BTreeMap::new();
    for &v in labels {
        *counts.entry(v).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_label_histogram() {
        let labels = Array3::from_shape_fn((2, 3, 4), |(i, j, _)| if i == 0 { 0u8 } else { j as u8 });
        let hist = label_histogram(&labels);
        assert_eq!(hist.get(&0), Some(&16));
        assert_eq!(hist.get(&1), Some(&4));
        assert_eq!(hist.get(&2), Some(&4));
        assert_eq!(hist.values().sum::<usize>(), 24);
    }
}
