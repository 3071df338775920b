//! Point-spread function of a slice acquisition.
//!
//! The acquisition of a slice pixel is modelled as an oriented Gaussian in
//! the slice's local frame with covariance
//!
//! ```text
//! Σ = diag((1.2·sx)², (1.2·sy)², sz²) / (8 ln 2)
//! ```
//!
//! i.e. an in-plane FWHM of 1.2 pixel spacings and a through-plane FWHM equal
//! to the slice thickness.

use std::fmt;
use std::str::FromStr;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};

/// Kernel used to simulate a slice pixel from the HR volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionKernel {
    /// Oriented Gaussian PSF, truncated at three standard deviations.
    #[default]
    OrientedGaussian,
    /// Trilinear sample at the pixel centre only.
    Linear,
}

impl fmt::Display for AcquisitionKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionKernel::OrientedGaussian => write!(f, "gaussian"),
            AcquisitionKernel::Linear => write!(f, "linear"),
        }
    }
}

impl FromStr for AcquisitionKernel {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gaussian" | "oriented_gaussian" => Ok(AcquisitionKernel::OrientedGaussian),
            "linear" => Ok(AcquisitionKernel::Linear),
            other => Err(ReconError::config(format!(
                "unknown acquisition kernel '{other}', expected gaussian or linear"
            ))),
        }
    }
}

/// Number of standard deviations the Gaussian is evaluated over.
const CUTOFF_SIGMAS: f64 = 3.0;

/// Discretised PSF: sample offsets in the slice's local frame (mm along the
/// slice's `i`, `j`, `k` axes) and their normalised weights.
#[derive(Debug, Clone, PartialEq)]
pub struct PsfKernel {
    offsets: Vec<Vector3<f64>>,
    weights: Vec<f64>,
}

impl PsfKernel {
    /// Discretise `kernel` for a slice with `slice_spacing` (in-plane spacing
    /// and thickness) onto offsets spaced by the HR voxel size.
    pub fn new(kernel: AcquisitionKernel, slice_spacing: &Vector3<f64>, hr_spacing: f64) -> Self {
        match kernel {
            AcquisitionKernel::Linear => Self {
                offsets: vec![Vector3::zeros()],
                weights: vec![1.0],
            },
            AcquisitionKernel::OrientedGaussian => Self::gaussian(slice_spacing, hr_spacing),
        }
    }

    /// Diagonal of the PSF covariance in the slice frame.
    pub fn variances(slice_spacing: &Vector3<f64>) -> Vector3<f64> {
        let scale = 8.0 * std::f64::consts::LN_2;
        Vector3::new(
            (1.2 * slice_spacing.x).powi(2) / scale,
            (1.2 * slice_spacing.y).powi(2) / scale,
            slice_spacing.z.powi(2) / scale,
        )
    }

    fn gaussian(slice_spacing: &Vector3<f64>, hr_spacing: f64) -> Self {
        let variances = Self::variances(slice_spacing);
        let half_width = |var: f64| (CUTOFF_SIGMAS * var.sqrt() / hr_spacing).floor() as i64;
        let (nx, ny, nz) = (
            half_width(variances.x),
            half_width(variances.y),
            half_width(variances.z),
        );

        let mut offsets = Vec::new();
        let mut weights = Vec::new();
        for c in -nz..=nz {
            for b in -ny..=ny {
                for a in -nx..=nx {
                    let d = Vector3::new(a as f64, b as f64, c as f64) * hr_spacing;
                    let exponent = d.x * d.x / variances.x
                        + d.y * d.y / variances.y
                        + d.z * d.z / variances.z;
                    offsets.push(d);
                    weights.push((-0.5 * exponent).exp());
                }
            }
        }
        let total: f64 = weights.iter().sum();
        weights.iter_mut().for_each(|w| *w /= total);

        Self { offsets, weights }
    }

    pub fn offsets(&self) -> &[Vector3<f64>] {
        &self.offsets
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_kernel_is_a_single_tap() {
        let psf = PsfKernel::new(AcquisitionKernel::Linear, &Vector3::new(1.0, 1.0, 4.0), 1.0);
        assert_eq!(psf.len(), 1);
        assert_eq!(psf.weights(), &[1.0]);
    }

    #[test]
    fn gaussian_weights_are_normalised_and_symmetric() {
        let psf = PsfKernel::new(
            AcquisitionKernel::OrientedGaussian,
            &Vector3::new(1.0, 1.0, 4.0),
            1.0,
        );
        // sigma ~0.51 mm in-plane (one tap either side), ~1.7 mm through-plane (five)
        assert_eq!(psf.len(), 3 * 3 * 11);
        assert!((psf.weights().iter().sum::<f64>() - 1.0).abs() < 1e-12);
        let centre = psf.len() / 2;
        assert_eq!(psf.offsets()[centre], Vector3::zeros());
        assert!(psf.weights().iter().all(|&w| w <= psf.weights()[centre]));
        assert!((psf.weights()[0] - psf.weights()[psf.len() - 1]).abs() < 1e-15);
    }

    #[test]
    fn thick_slices_widen_through_plane() {
        let thin = PsfKernel::variances(&Vector3::new(1.0, 1.0, 1.0));
        let thick = PsfKernel::variances(&Vector3::new(1.0, 1.0, 3.0));
        assert!((thick.z / thin.z - 9.0).abs() < 1e-12);
        assert_eq!(thick.x, thin.x);
    }

    #[test]
    fn parses_kernel_names() {
        assert_eq!("Linear".parse::<AcquisitionKernel>().unwrap(), AcquisitionKernel::Linear);
        assert_eq!(
            "gaussian".parse::<AcquisitionKernel>().unwrap(),
            AcquisitionKernel::OrientedGaussian
        );
        assert!("box".parse::<AcquisitionKernel>().is_err());
    }
}
