//! Matrix-free linear operators.
//!
//! Every operator in the reconstruction is defined by a forward and an
//! adjoint application; no matrix is ever formed. The solver only sees the
//! [`LinearOperator`] trait:
//!
//! + [`SliceAcquisition`]: HR volume -> simulated slice pixels
//!
//! + [`Identity`] / [`Gradient`]: zeroth / first order Tikhonov operators
//!
//! + [`AugmentedOperator`]: the stacked system `[A; w·D]`

pub mod acquisition;
pub mod psf;
pub mod regularization;

pub use acquisition::SliceAcquisition;
pub use psf::{AcquisitionKernel, PsfKernel};
pub use regularization::{Gradient, Identity, Regularization};

use ndarray::{Array1, ArrayView1, Axis};

use crate::error::{ReconError, Result};

/// A linear map `R^cols -> R^rows` given by its forward and adjoint action.
pub trait LinearOperator {
    fn rows(&self) -> usize;

    fn cols(&self) -> usize;

    /// `A x`
    fn apply(&self, x: ArrayView1<f64>) -> Result<Array1<f64>>;

    /// `Aᵀ y`
    fn apply_adjoint(&self, y: ArrayView1<f64>) -> Result<Array1<f64>>;
}

pub(crate) fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ReconError::shape(&[expected], &[actual]))
    }
}

/// Vertical stack `[A; w·D]` of a data operator and a weighted penalty
/// operator sharing the same domain.
pub struct AugmentedOperator<'a> {
    data: &'a dyn LinearOperator,
    penalty: &'a dyn LinearOperator,
    weight: f64,
}

impl<'a> AugmentedOperator<'a> {
    pub fn new(
        data: &'a dyn LinearOperator,
        penalty: &'a dyn LinearOperator,
        weight: f64,
    ) -> Result<Self> {
        if data.cols() != penalty.cols() {
            return Err(ReconError::shape(&[data.cols()], &[penalty.cols()]));
        }
        Ok(Self {
            data,
            penalty,
            weight,
        })
    }

    /// Right-hand side `[y; 0]` for an observation vector `y`.
    pub fn augment(&self, observations: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len(self.data.rows(), observations.len())?;
        let mut rhs = Array1::zeros(self.rows());
        rhs.slice_mut(ndarray::s![..self.data.rows()])
            .assign(&observations);
        Ok(rhs)
    }
}

impl LinearOperator for AugmentedOperator<'_> {
    fn rows(&self) -> usize {
        self.data.rows() + self.penalty.rows()
    }

    fn cols(&self) -> usize {
        self.data.cols()
    }

    fn apply(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len(self.cols(), x.len())?;
        let ax = self.data.apply(x)?;
        let dx = self.penalty.apply(x)? * self.weight;
        Ok(ndarray::concatenate(Axis(0), &[ax.view(), dx.view()])?)
    }

    fn apply_adjoint(&self, y: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len(self.rows(), y.len())?;
        let (upper, lower) = y.split_at(Axis(0), self.data.rows());
        let mut out = self.data.apply_adjoint(upper)?;
        out.scaled_add(self.weight, &self.penalty.apply_adjoint(lower)?);
        Ok(out)
    }
}
