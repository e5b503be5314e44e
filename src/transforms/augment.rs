//! Random geometric augmentation applied jointly to an image and its labels.
//!
//! Only label-preserving transforms are used: flips along the first two axes
//! and quarter-turn rotations in the plane they span. Both arrays receive the
//! exact same operations, so every voxel keeps its class.

use crate::error::{Error, Result};
use ndarray::{Array, Array3, Array4, Axis, Dimension};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

/// Random number generator with optional seeding for reproducibility.
#[allow(clippy::option_if_let_else)] // match is clearer than map_or_else here
pub(crate) fn get_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    }
}

/// One concrete draw of augmentation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AugmentParams {
    /// Reverse axis 0.
    pub flip_depth: bool,
    /// Reverse axis 1.
    pub flip_height: bool,
    /// Number of quarter turns in the (0, 1) plane, in `0..4`.
    pub quarter_turns: u8,
}

impl AugmentParams {
    /// True when applying these parameters changes nothing.
    pub fn is_identity(&self) -> bool {
        !self.flip_depth && !self.flip_height && self.quarter_turns % 4 == 0
    }

    /// Apply to any array with at least two axes.
    ///
    /// Flips run first, then the rotation. Odd turn counts swap the extents of
    /// axes 0 and 1.
    pub fn apply_to<T: Clone, D: Dimension>(&self, array: Array<T, D>) -> Array<T, D> {
        if self.is_identity() {
            return array;
        }

        let mut view = array.view();
        if self.flip_depth {
            view.invert_axis(Axis(0));
        }
        if self.flip_height {
            view.invert_axis(Axis(1));
        }
        for _ in 0..self.quarter_turns % 4 {
            view.swap_axes(0, 1);
            view.invert_axis(Axis(1));
        }
        // The copy has to finish before `array` goes out of scope.
        #[allow(clippy::let_and_return)]
        let out = view.as_standard_layout().into_owned();
        out
    }

    /// Apply to an image `(D, H, W, C)` and its label `(D, H, W)`.
    pub fn apply(&self, image: Array4<f32>, label: Array3<u8>) -> Result<(Array4<f32>, Array3<u8>)> {
        check_pair(&image, &label)?;
        Ok((self.apply_to(image), self.apply_to(label)))
    }
}

fn check_pair(image: &Array4<f32>, label: &Array3<u8>) -> Result<()> {
    let (d, h, w, _) = image.dim();
    if (d, h, w) != label.dim() {
        return Err(Error::shape(format!(
            "image spatial shape {:?} does not match label shape {:?}",
            (d, h, w),
            label.dim()
        )));
    }
    Ok(())
}

/// Samples [`AugmentParams`] from a random source.
///
/// Rotations are uniform over the four quarter turns only when axes 0 and 1
/// have the same extent. On a non-square plane only 0 and 180 degree turns
/// are drawn, each with probability 1/2, so every sample keeps its shape and
/// batches stay stackable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmenter {
    flip_prob: f64,
}

impl Default for Augmenter {
    fn default() -> Self {
        Self { flip_prob: 0.5 }
    }
}

impl Augmenter {
    /// Augmenter flipping each axis with probability `flip_prob`.
    pub fn new(flip_prob: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&flip_prob) {
            return Err(Error::Configuration(format!(
                "flip probability must be in [0, 1], got {flip_prob}"
            )));
        }
        Ok(Self { flip_prob })
    }

    /// Probability of flipping each of the first two axes.
    pub fn flip_prob(&self) -> f64 {
        self.flip_prob
    }

    /// Draw parameters for a volume whose first two extents are `plane`.
    ///
    /// Draw order is fixed: depth flip, height flip, rotation. When the plane
    /// is not square only half and full turns are drawn, so the output shape
    /// always equals the input shape.
    pub fn sample<R: Rng + ?Sized>(&self, plane: (usize, usize), rng: &mut R) -> AugmentParams {
        let flip_depth = rng.gen_bool(self.flip_prob);
        let flip_height = rng.gen_bool(self.flip_prob);
        let quarter_turns = if plane.0 == plane.1 {
            rng.gen_range(0..4u8)
        } else {
            rng.gen_range(0..2u8) * 2
        };
        AugmentParams {
            flip_depth,
            flip_height,
            quarter_turns,
        }
    }

    /// Draw parameters and apply them to an image/label pair.
    pub fn augment<R: Rng + ?Sized>(
        &self,
        image: Array4<f32>,
        label: Array3<u8>,
        rng: &mut R,
    ) -> Result<(Array4<f32>, Array3<u8>)> {
        check_pair(&image, &label)?;
        let (d, h, _, _) = image.dim();
        self.sample((d, h), rng).apply(image, label)
    }
}

/// Augment with the default flip probability.
pub fn augment<R: Rng + ?Sized>(
    image: Array4<f32>,
    label: Array3<u8>,
    rng: &mut R,
) -> Result<(Array4<f32>, Array3<u8>)> {
    Augmenter::default().augment(image, label, rng)
}
