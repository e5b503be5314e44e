//! Resampling volumes onto a fixed voxel grid.
//!
//! Output index `o` along an axis of source extent `s` and target extent `t`
//! samples source coordinate `o * (s - 1) / (t - 1)`, so the first and last
//! voxels of both grids coincide and resampling to the source shape is exact.

use super::Interpolation;
use crate::error::{Error, Result};
use ndarray::{Array3, ArrayBase, ArrayViewD, Data, Ix3, Zip};

/// Source coordinate for every output index along one axis.
fn axis_coordinates(source: usize, target: usize) -> Vec<f64> {
    if target == 1 {
        return vec![0.0];
    }
    let span = (source - 1) as f64;
    let steps = (target - 1) as f64;
    (0..target).map(|o| o as f64 * span / steps).collect()
}

/// Lower neighbour, upper neighbour and weight of the upper one.
fn linear_taps(source: usize, target: usize) -> Vec<(usize, usize, f64)> {
    axis_coordinates(source, target)
        .into_iter()
        .map(|x| {
            let lo = (x.floor() as usize).min(source - 1);
            let hi = (lo + 1).min(source - 1);
            (lo, hi, x - lo as f64)
        })
        .collect()
}

fn nearest_taps(source: usize, target: usize) -> Vec<usize> {
    axis_coordinates(source, target)
        .into_iter()
        .map(|x| ((x + 0.5).floor() as usize).min(source - 1))
        .collect()
}

fn check_shapes(source: [usize; 3], target: [usize; 3]) -> Result<()> {
    if source.contains(&0) {
        return Err(Error::shape(format!(
            "cannot resample empty volume of shape {source:?}"
        )));
    }
    if target.contains(&0) {
        return Err(Error::shape(format!(
            "target shape {target:?} must be positive"
        )));
    }
    Ok(())
}

fn shape3<S: Data, D>(volume: &ArrayBase<S, D>) -> [usize; 3]
where
    D: ndarray::Dimension,
{
    let s = volume.shape();
    [s[0], s[1], s[2]]
}

/// Trilinear resampling of a continuous-valued volume.
#[must_use = "this function returns a new volume"]
pub fn resample_trilinear<S>(volume: &ArrayBase<S, Ix3>, target: [usize; 3]) -> Result<Array3<f32>>
where
    S: Data<Elem = f32> + Sync,
{
    let source = shape3(volume);
    check_shapes(source, target)?;

    let [tx, ty, tz] = [
        linear_taps(source[0], target[0]),
        linear_taps(source[1], target[1]),
        linear_taps(source[2], target[2]),
    ];
    let v = volume.view();

    let mut out = Array3::<f32>::zeros(target);
    Zip::indexed(&mut out).par_for_each(|(i, j, k), out| {
        let (x0, x1, wx) = tx[i];
        let (y0, y1, wy) = ty[j];
        let (z0, z1, wz) = tz[k];
        let at = |x: usize, y: usize, z: usize| f64::from(v[[x, y, z]]);

        let c00 = at(x0, y0, z0) * (1.0 - wz) + at(x0, y0, z1) * wz;
        let c01 = at(x0, y1, z0) * (1.0 - wz) + at(x0, y1, z1) * wz;
        let c10 = at(x1, y0, z0) * (1.0 - wz) + at(x1, y0, z1) * wz;
        let c11 = at(x1, y1, z0) * (1.0 - wz) + at(x1, y1, z1) * wz;
        let c0 = c00 * (1.0 - wy) + c01 * wy;
        let c1 = c10 * (1.0 - wy) + c11 * wy;
        *out = (c0 * (1.0 - wx) + c1 * wx) as f32;
    });
    Ok(out)
}

/// Nearest-neighbour resampling; every output value is copied from the input.
#[must_use = "this function returns a new volume"]
pub fn resample_nearest<T, S>(volume: &ArrayBase<S, Ix3>, target: [usize; 3]) -> Result<Array3<T>>
where
    T: Copy + Default + Send + Sync,
    S: Data<Elem = T> + Sync,
{
    let source = shape3(volume);
    check_shapes(source, target)?;

    let [tx, ty, tz] = [
        nearest_taps(source[0], target[0]),
        nearest_taps(source[1], target[1]),
        nearest_taps(source[2], target[2]),
    ];
    let v = volume.view();

    let mut out = Array3::<T>::default(target);
    Zip::indexed(&mut out).par_for_each(|(i, j, k), out| {
        *out = v[[tx[i], ty[j], tz[k]]];
    });
    Ok(out)
}

/// Resample a continuous-valued volume with the given policy.
pub fn resample<S>(
    volume: &ArrayBase<S, Ix3>,
    target: [usize; 3],
    method: Interpolation,
) -> Result<Array3<f32>>
where
    S: Data<Elem = f32> + Sync,
{
    match method {
        Interpolation::Trilinear => resample_trilinear(volume, target),
        Interpolation::Nearest => resample_nearest(volume, target),
    }
}

/// Like [`resample`] for arrays of unknown dimensionality.
///
/// Fails with [`Error::Shape`] unless the input is exactly 3-D.
pub fn resample_dyn(
    volume: ArrayViewD<'_, f32>,
    target: [usize; 3],
    method: Interpolation,
) -> Result<Array3<f32>> {
    let ndim = volume.ndim();
    let volume = volume.into_dimensionality::<Ix3>().map_err(|_| {
        Error::shape(format!("resampling needs a 3-D volume, got {ndim} dimensions"))
    })?;
    resample(&volume, target, method)
}
