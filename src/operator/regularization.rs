//! Tikhonov penalty operators.

use std::fmt;
use std::str::FromStr;

use ndarray::{s, Array1, Array3, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

use super::{check_len, LinearOperator};
use crate::error::{ReconError, Result};
use crate::geometry::Geometry;

/// Order of the Tikhonov penalty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regularization {
    /// `||x||²`
    #[serde(rename = "TK0")]
    Tk0,
    /// `||∇x||²`
    #[default]
    #[serde(rename = "TK1")]
    Tk1,
}

impl Regularization {
    /// Penalty operator `D` on the grid of `geometry`.
    pub fn operator(&self, geometry: &Geometry) -> Box<dyn LinearOperator + Sync> {
        match self {
            Regularization::Tk0 => Box::new(Identity::new(geometry.len())),
            Regularization::Tk1 => Box::new(Gradient::new(geometry)),
        }
    }
}

impl fmt::Display for Regularization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regularization::Tk0 => write!(f, "TK0"),
            Regularization::Tk1 => write!(f, "TK1"),
        }
    }
}

impl FromStr for Regularization {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TK0" => Ok(Regularization::Tk0),
            "TK1" => Ok(Regularization::Tk1),
            other => Err(ReconError::config(format!(
                "unknown regularization '{other}', expected TK0 or TK1"
            ))),
        }
    }
}

/// Zeroth order penalty: the identity on `n` unknowns.
pub struct Identity {
    n: usize,
}

impl Identity {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl LinearOperator for Identity {
    fn rows(&self) -> usize {
        self.n
    }

    fn cols(&self) -> usize {
        self.n
    }

    fn apply(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len(self.n, x.len())?;
        Ok(x.to_owned())
    }

    fn apply_adjoint(&self, y: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.apply(y)
    }
}

/// First order penalty: forward differences along `i`, `j` and `k`, scaled
/// by the inverse voxel size.
///
/// The output stacks the three components `[∂i; ∂j; ∂k]`. The difference at
/// the last index of an axis is zero (Neumann boundary); the adjoint is the
/// negative backward divergence with the same convention.
pub struct Gradient {
    shape: (usize, usize, usize),
    inv_spacing: [f64; 3],
}

impl Gradient {
    pub fn new(geometry: &Geometry) -> Self {
        let spacing = geometry.spacing();
        Self {
            shape: geometry.shape(),
            inv_spacing: [1.0 / spacing.x, 1.0 / spacing.y, 1.0 / spacing.z],
        }
    }

    fn len(&self) -> usize {
        self.shape.0 * self.shape.1 * self.shape.2
    }
}

impl LinearOperator for Gradient {
    fn rows(&self) -> usize {
        3 * self.len()
    }

    fn cols(&self) -> usize {
        self.len()
    }

    fn apply(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len(self.cols(), x.len())?;
        let (nz, ny, nx) = self.shape;
        let x = x.into_shape(self.shape)?;
        let [hx, hy, hz] = self.inv_spacing;

        let mut out = Array1::<f64>::zeros(self.rows());
        {
            let mut g = out.view_mut().into_shape((3, nz, ny, nx))?;
            let diff = |h: f64| move |g: &mut f64, &a: &f64, &b: &f64| *g = (a - b) * h;
            Zip::from(g.slice_mut(s![0, .., .., ..-1]))
                .and(x.slice(s![.., .., 1..]))
                .and(x.slice(s![.., .., ..-1]))
                .for_each(diff(hx));
            Zip::from(g.slice_mut(s![1, .., ..-1, ..]))
                .and(x.slice(s![.., 1.., ..]))
                .and(x.slice(s![.., ..-1, ..]))
                .for_each(diff(hy));
            Zip::from(g.slice_mut(s![2, ..-1, .., ..]))
                .and(x.slice(s![1.., .., ..]))
                .and(x.slice(s![..-1, .., ..]))
                .for_each(diff(hz));
        }
        Ok(out)
    }

    fn apply_adjoint(&self, y: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len(self.rows(), y.len())?;
        let (nz, ny, nx) = self.shape;
        let g = y.into_shape((3, nz, ny, nx))?;
        let [hx, hy, hz] = self.inv_spacing;

        let mut out = Array3::<f64>::zeros(self.shape);
        let gi = g.slice(s![0, .., .., ..-1]);
        Zip::from(out.slice_mut(s![.., .., 1..])).and(&gi).for_each(|o, &v| *o += v * hx);
        Zip::from(out.slice_mut(s![.., .., ..-1])).and(&gi).for_each(|o, &v| *o -= v * hx);

        let gj = g.slice(s![1, .., ..-1, ..]);
        Zip::from(out.slice_mut(s![.., 1.., ..])).and(&gj).for_each(|o, &v| *o += v * hy);
        Zip::from(out.slice_mut(s![.., ..-1, ..])).and(&gj).for_each(|o, &v| *o -= v * hy);

        let gk = g.slice(s![2, ..-1, .., ..]);
        Zip::from(out.slice_mut(s![1.., .., ..])).and(&gk).for_each(|o, &v| *o += v * hz);
        Zip::from(out.slice_mut(s![..-1, .., ..])).and(&gk).for_each(|o, &v| *o -= v * hz);

        Ok(out.into_shape(self.len())?)
    }
}
