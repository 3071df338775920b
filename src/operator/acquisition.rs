//! Slice-acquisition operator `A`: HR volume -> slice pixels.
//!
//! Each row of `A` is one masked-in slice pixel. Its value is the PSF-weighted
//! sum of trilinear samples of the HR volume around the pixel centre, with
//! the PSF oriented along the slice's current placement. The adjoint splats
//! a row value back with exactly the same weights, so `Aᵀ` is the transpose
//! of `A` for every kernel.
//!
//! Row geometry (pixel centres and PSF taps in HR index space) is computed
//! once per operator; the weights themselves are re-evaluated on every
//! application.

use nalgebra::Vector3;
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use tracing::debug;

use super::psf::{AcquisitionKernel, PsfKernel};
use super::{check_len, LinearOperator};
use crate::error::Result;
use crate::geometry::Geometry;
use crate::interpolation::Interpolator;
use crate::slice::Slice;
use crate::stack::Stack;

/// Number of partial volumes the adjoint reduces over. Fixed so that the
/// summation order does not depend on the thread pool.
const ADJOINT_PARTIALS: usize = 8;

/// Rows contributed by one slice.
struct SliceRows {
    stack_id: String,
    index: usize,
    /// `[j, i]` of every row's pixel.
    pixels: Vec<[usize; 2]>,
    /// Pixel centres as continuous HR indices.
    centres: Vec<Vector3<f64>>,
    /// PSF taps as HR index offsets, with weights.
    taps: Vec<(Vector3<f64>, f64)>,
}

impl SliceRows {
    fn new(slice: &Slice, hr: &Geometry, kernel: AcquisitionKernel) -> Self {
        let placement = slice.geometry();
        let pixel_to_hr = hr.world_to_index_matrix() * placement.index_to_world_matrix();
        let origin = hr.world_to_index(placement.origin());

        let (pixels, centres) = slice
            .mask()
            .indexed_iter()
            .filter(|(_, inside)| **inside)
            .map(|((j, i), _)| {
                let centre = pixel_to_hr * Vector3::new(i as f64, j as f64, 0.0) + origin;
                ([j, i], centre)
            })
            .filter(|(_, centre)| hr.contains_index(centre))
            .unzip();

        let hr_spacing = hr.spacing().min();
        let psf = PsfKernel::new(kernel, placement.spacing(), hr_spacing);
        let local_to_hr = hr.world_to_index_matrix() * placement.direction();
        let taps = psf
            .offsets()
            .iter()
            .zip(psf.weights())
            .map(|(offset, &weight)| (local_to_hr * offset, weight))
            .collect();

        Self {
            stack_id: slice.stack_id().to_string(),
            index: slice.index(),
            pixels,
            centres,
            taps,
        }
    }

    fn observations(&self, slice: &Slice) -> Vec<f64> {
        self.pixels.iter().map(|&pixel| slice.data()[pixel]).collect()
    }

    fn len(&self) -> usize {
        self.centres.len()
    }

    #[inline]
    fn flat(shape: (usize, usize, usize), [k, j, i]: [usize; 3]) -> usize {
        (k * shape.1 + j) * shape.2 + i
    }

    fn forward(&self, x: &ArrayView1<f64>, shape: (usize, usize, usize)) -> Vec<f64> {
        self.centres
            .iter()
            .map(|centre| {
                let mut value = 0.0;
                for (offset, weight) in &self.taps {
                    Interpolator::for_each_neighbour(shape, &(centre + offset), |idx, w| {
                        value += weight * w * x[Self::flat(shape, idx)];
                    });
                }
                value
            })
            .collect()
    }

    fn adjoint(&self, r: &[f64], out: &mut Array1<f64>, shape: (usize, usize, usize)) {
        for (centre, &value) in self.centres.iter().zip(r) {
            if value == 0.0 {
                continue;
            }
            for (offset, weight) in &self.taps {
                let scaled = value * weight;
                Interpolator::for_each_neighbour(shape, &(centre + offset), |idx, w| {
                    out[Self::flat(shape, idx)] += scaled * w;
                });
            }
        }
    }
}

/// Matrix-free forward model mapping an HR volume to all observed slice
/// pixels of a set of stacks.
pub struct SliceAcquisition {
    hr: Geometry,
    slices: Vec<SliceRows>,
    offsets: Vec<usize>,
    rows: usize,
    observations: Array1<f64>,
}

impl SliceAcquisition {
    /// Build the operator for the current slice placements of `stacks` on
    /// the HR grid `hr`. Slices without masked-in pixels inside the grid
    /// contribute no rows.
    pub fn new(stacks: &[Stack], hr: &Geometry, kernel: AcquisitionKernel) -> Self {
        let all: Vec<&Slice> = stacks
            .iter()
            .flat_map(|stack| stack.slices())
            .filter(|slice| slice.has_masked_pixels())
            .collect();

        let built: Vec<(SliceRows, Vec<f64>)> = all
            .par_iter()
            .map(|slice| {
                let rows = SliceRows::new(slice, hr, kernel);
                let values = rows.observations(slice);
                (rows, values)
            })
            .collect();

        let mut slices = Vec::with_capacity(built.len());
        let mut offsets = Vec::with_capacity(built.len());
        let mut observations = Vec::new();
        let mut rows = 0;
        for (slice_rows, values) in built {
            if slice_rows.len() == 0 {
                debug!(
                    stack = %slice_rows.stack_id,
                    slice = slice_rows.index,
                    "slice has no pixels inside the HR grid, skipping"
                );
                continue;
            }
            offsets.push(rows);
            rows += slice_rows.len();
            observations.extend(values);
            slices.push(slice_rows);
        }

        debug!(
            slices = slices.len(),
            rows,
            cols = hr.len(),
            "built slice-acquisition operator"
        );

        Self {
            hr: hr.clone(),
            slices,
            offsets,
            rows,
            observations: Array1::from(observations),
        }
    }

    /// Observed slice pixel values `y`, in row order.
    pub fn observations(&self) -> &Array1<f64> {
        &self.observations
    }

    pub fn geometry(&self) -> &Geometry {
        &self.hr
    }

    /// Number of slices contributing at least one row.
    pub fn active_slices(&self) -> usize {
        self.slices.len()
    }

    /// `(stack id, slice index)` of every contributing slice, in row order.
    pub fn slice_ids(&self) -> impl Iterator<Item = (&str, usize)> {
        self.slices
            .iter()
            .map(|rows| (rows.stack_id.as_str(), rows.index))
    }

    /// Slice pixel `(stack id, slice index, [j, i])` behind every row, in
    /// row order.
    pub fn row_pixels(&self) -> impl Iterator<Item = (&str, usize, [usize; 2])> {
        self.slices.iter().flat_map(|rows| {
            rows.pixels
                .iter()
                .map(move |&pixel| (rows.stack_id.as_str(), rows.index, pixel))
        })
    }

    fn row_range(&self, s: usize) -> std::ops::Range<usize> {
        self.offsets[s]..self.offsets[s] + self.slices[s].len()
    }
}

impl LinearOperator for SliceAcquisition {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.hr.len()
    }

    fn apply(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len(self.cols(), x.len())?;
        let shape = self.hr.shape();
        let per_slice: Vec<Vec<f64>> = self
            .slices
            .par_iter()
            .map(|rows| rows.forward(&x, shape))
            .collect();
        Ok(per_slice.into_iter().flatten().collect())
    }

    fn apply_adjoint(&self, y: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len(self.rows(), y.len())?;
        let shape = self.hr.shape();
        let n = self.cols();
        let y = y.to_vec();

        let chunk = self.slices.len().div_ceil(ADJOINT_PARTIALS).max(1);
        let partials: Vec<Array1<f64>> = (0..self.slices.len())
            .collect::<Vec<_>>()
            .par_chunks(chunk)
            .map(|indices| {
                let mut acc = Array1::<f64>::zeros(n);
                for &s in indices {
                    self.slices[s].adjoint(&y[self.row_range(s)], &mut acc, shape);
                }
                acc
            })
            .collect();

        let mut out = Array1::<f64>::zeros(n);
        for partial in &partials {
            out += partial;
        }
        Ok(out)
    }
}
