//! Volume estimates from scattered slices, used as registration targets.

use std::fmt;
use std::str::FromStr;

use nalgebra::Vector3;
use ndarray::{Array3, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReconError, Result};
use crate::geometry::Geometry;
use crate::interpolation::Interpolator;
use crate::stack::Stack;
use crate::volume::Volume;

/// Denominators at or below this are treated as "no data".
const MIN_WEIGHT: f64 = 1e-10;

/// Strategy producing a 3D estimate from slices at their current placement.
pub trait VolumeEstimator: Sync {
    fn estimate(&self, stacks: &[&Stack], target: &Geometry) -> Result<Volume>;
}

/// Runtime choice of [`VolumeEstimator`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeEstimate {
    #[default]
    Sda,
    Average,
}

impl VolumeEstimate {
    pub fn estimator(&self, sigma: f64, mask_voxels: bool) -> Box<dyn VolumeEstimator> {
        match self {
            VolumeEstimate::Sda => Box::new(ScatteredDataApproximation::new(sigma)),
            VolumeEstimate::Average => Box::new(StackAverage { mask_voxels }),
        }
    }
}

impl fmt::Display for VolumeEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeEstimate::Sda => write!(f, "sda"),
            VolumeEstimate::Average => write!(f, "average"),
        }
    }
}

impl FromStr for VolumeEstimate {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sda" => Ok(VolumeEstimate::Sda),
            "average" => Ok(VolumeEstimate::Average),
            other => Err(ReconError::config(format!(
                "unknown volume estimate '{other}', expected sda or average"
            ))),
        }
    }
}

fn require_stacks(stacks: &[&Stack]) -> Result<()> {
    if stacks.is_empty() {
        return Err(ReconError::EmptyInput(
            "volume estimate needs at least one stack".to_string(),
        ));
    }
    Ok(())
}

/// Voxel-wise mean of the stacks' slice-based resamplings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackAverage {
    /// Restrict the returned mask to voxels covered by at least one stack.
    pub mask_voxels: bool,
}

impl VolumeEstimator for StackAverage {
    fn estimate(&self, stacks: &[&Stack], target: &Geometry) -> Result<Volume> {
        require_stacks(stacks)?;
        let mut sum = Array3::<f64>::zeros(target.shape());
        let mut count = Array3::<f64>::zeros(target.shape());
        for stack in stacks {
            let resampled = stack.resampled_from_slices(target);
            Zip::from(&mut sum)
                .and(&mut count)
                .and(resampled.data())
                .and(resampled.mask())
                .for_each(|s, c, &v, &m| {
                    if m {
                        *s += v;
                        *c += 1.0;
                    }
                });
        }

        let data = Zip::from(&sum)
            .and(&count)
            .map_collect(|&s, &c| if c > 0.0 { s / c } else { 0.0 });
        let mask = if self.mask_voxels {
            count.mapv(|c| c > 0.0)
        } else {
            Array3::from_elem(target.shape(), true)
        };
        debug!(stacks = stacks.len(), "stack average");
        Volume::new("average", data, mask, target.clone())
    }
}

/// Shepard-type scattered data approximation with a Gaussian kernel.
///
/// Every masked slice pixel is splatted (value and unit weight) into the
/// target grid; both fields are smoothed with a Gaussian of width `sigma`
/// (mm) and the estimate is their ratio wherever the smoothed weight is
/// positive.
#[derive(Debug, Clone, Copy)]
pub struct ScatteredDataApproximation {
    sigma: f64,
}

impl Default for ScatteredDataApproximation {
    fn default() -> Self {
        Self { sigma: 1.0 }
    }
}

impl ScatteredDataApproximation {
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    fn splat(stacks: &[&Stack], target: &Geometry) -> (Array3<f64>, Array3<f64>) {
        let mut numerator = Array3::<f64>::zeros(target.shape());
        let mut denominator = Array3::<f64>::zeros(target.shape());
        for slice in stacks.iter().flat_map(|stack| stack.slices()) {
            let placement = slice.geometry();
            let pixel_to_target =
                target.world_to_index_matrix() * placement.index_to_world_matrix();
            let origin = target.world_to_index(placement.origin());
            for ((j, i), &inside) in slice.mask().indexed_iter() {
                if !inside {
                    continue;
                }
                let idx = pixel_to_target * Vector3::new(i as f64, j as f64, 0.0) + origin;
                Interpolator::splat(&mut numerator.view_mut(), &idx, slice.data()[[j, i]]);
                Interpolator::splat(&mut denominator.view_mut(), &idx, 1.0);
            }
        }
        (numerator, denominator)
    }

    /// Separable Gaussian smoothing with zero padding, truncated at 3σ.
    fn smooth(field: Array3<f64>, spacing: &Vector3<f64>, sigma: f64) -> Array3<f64> {
        // array axes are (k, j, i)
        let widths = [sigma / spacing.z, sigma / spacing.y, sigma / spacing.x];
        widths
            .iter()
            .enumerate()
            .fold(field, |field, (axis, &width)| {
                let kernel = gaussian_kernel(width);
                convolve_axis(&field, Axis(axis), &kernel)
            })
    }
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (3.0 * sigma).ceil() as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|d| (-0.5 * (d as f64 / sigma).powi(2)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= total);
    kernel
}

fn convolve_axis(field: &Array3<f64>, axis: Axis, kernel: &[f64]) -> Array3<f64> {
    let radius = (kernel.len() / 2) as isize;
    let n = field.len_of(axis) as isize;
    let mut out = Array3::<f64>::zeros(field.raw_dim());
    Zip::indexed(&mut out).par_for_each(|(k, j, i), value| {
        let mut index = [k, j, i];
        let centre = index[axis.index()] as isize;
        let mut acc = 0.0;
        for (t, &w) in kernel.iter().enumerate() {
            let pos = centre + t as isize - radius;
            if pos < 0 || pos >= n {
                continue;
            }
            index[axis.index()] = pos as usize;
            acc = field[index].mul_add(w, acc);
        }
        *value = acc;
    });
    out
}

impl VolumeEstimator for ScatteredDataApproximation {
    fn estimate(&self, stacks: &[&Stack], target: &Geometry) -> Result<Volume> {
        require_stacks(stacks)?;
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(ReconError::config(format!(
                "sigma must be positive, got {}",
                self.sigma
            )));
        }
        let (numerator, denominator) = Self::splat(stacks, target);
        let numerator = Self::smooth(numerator, target.spacing(), self.sigma);
        let denominator = Self::smooth(denominator, target.spacing(), self.sigma);

        let data = Zip::from(&numerator)
            .and(&denominator)
            .map_collect(|&n, &d| if d > MIN_WEIGHT { n / d } else { 0.0 });
        let mask = denominator.mapv(|d| d > MIN_WEIGHT);
        debug!(stacks = stacks.len(), sigma = self.sigma, "scattered data approximation");
        Volume::new("sda", data, mask, target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::AffineTransform;

    fn stack(name: &str, value: impl Fn(usize, usize, usize) -> f64) -> Stack {
        let geometry = Geometry::axis_aligned((4, 6, 6), Vector3::new(1.0, 1.0, 2.0)).unwrap();
        let data = Array3::from_shape_fn((4, 6, 6), |(k, j, i)| value(k, j, i));
        Stack::from_volume(name, data, None, geometry).unwrap()
    }

    fn target() -> Geometry {
        Geometry::axis_aligned((7, 6, 6), Vector3::repeat(1.0)).unwrap()
    }

    #[test]
    fn average_of_constant_stacks() {
        let a = stack("a", |_, _, _| 2.0);
        let b = stack("b", |_, _, _| 4.0);
        let estimate = StackAverage { mask_voxels: true }
            .estimate(&[&a, &b], &target())
            .unwrap();
        // k = 2 lies on slice 1 of both stacks
        assert!((estimate.data()[[2, 3, 3]] - 3.0).abs() < 1e-12);
        assert!(estimate.mask()[[2, 3, 3]]);
    }

    #[test]
    fn average_mask_follows_coverage() {
        let mut a = stack("a", |_, _, _| 1.0);
        let far = AffineTransform::from_translation(Vector3::new(100.0, 0.0, 0.0));
        for slice in a.slices_mut() {
            slice.update_transform(&far).unwrap();
        }
        let masked = StackAverage { mask_voxels: true }.estimate(&[&a], &target()).unwrap();
        assert_eq!(masked.masked_voxel_count(), 0);
        let unmasked = StackAverage { mask_voxels: false }.estimate(&[&a], &target()).unwrap();
        assert_eq!(unmasked.masked_voxel_count(), target().len());
        assert!(unmasked.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn sda_reproduces_constants() {
        let a = stack("a", |_, _, _| 5.0);
        let estimate = ScatteredDataApproximation::default()
            .estimate(&[&a], &target())
            .unwrap();
        for (&v, &m) in estimate.data().iter().zip(estimate.mask()) {
            if m {
                assert!((v - 5.0).abs() < 1e-9);
            }
        }
        assert!(estimate.mask()[[3, 2, 2]]);
    }

    #[test]
    fn sda_stays_within_sample_range() {
        let a = stack("a", |k, j, i| (k * 7 + j * 3 + i) as f64);
        let estimate = ScatteredDataApproximation::new(1.5)
            .estimate(&[&a], &target())
            .unwrap();
        let max = 3.0 * 7.0 + 5.0 * 3.0 + 5.0;
        for (&v, &m) in estimate.data().iter().zip(estimate.mask()) {
            if m {
                assert!((-1e-9..=max + 1e-9).contains(&v));
            }
        }
    }

    #[test]
    fn gaussian_kernel_is_normalised() {
        let kernel = gaussian_kernel(1.3);
        assert_eq!(kernel.len(), 2 * 4 + 1);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn needs_at_least_one_stack() {
        assert!(StackAverage::default().estimate(&[], &target()).is_err());
        assert!(ScatteredDataApproximation::default().estimate(&[], &target()).is_err());
        assert!(ScatteredDataApproximation::new(0.0)
            .estimate(&[&stack("a", |_, _, _| 1.0)], &target())
            .is_err());
    }

    #[test]
    fn parses_estimate_names() {
        assert_eq!("SDA".parse::<VolumeEstimate>().unwrap(), VolumeEstimate::Sda);
        assert_eq!("average".parse::<VolumeEstimate>().unwrap(), VolumeEstimate::Average);
        assert!("median".parse::<VolumeEstimate>().is_err());
    }
}
