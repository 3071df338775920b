use nalgebra::Vector3;
use ndarray::{Array3, ArrayView3, ArrayViewMut3, Zip};

use crate::geometry::Geometry;

/// Trilinear sampling with zero padding, and its exact transpose.
pub(crate) struct Interpolator;

impl Interpolator {
    /// Visit the (up to) eight grid neighbours of a continuous `(i, j, k)`
    /// index together with their trilinear weights. Neighbours outside the
    /// grid are skipped, which amounts to zero padding.
    #[inline]
    pub(crate) fn for_each_neighbour<F>(
        shape: (usize, usize, usize),
        index: &Vector3<f64>,
        mut f: F,
    ) where
        F: FnMut([usize; 3], f64),
    {
        let (nz, ny, nx) = shape;
        let (xf, yf, zf) = (index.x.floor(), index.y.floor(), index.z.floor());
        let (dx, dy, dz) = (index.x - xf, index.y - yf, index.z - zf);
        let (x0, y0, z0) = (xf as isize, yf as isize, zf as isize);

        for (oz, wz) in [(0, 1.0 - dz), (1, dz)] {
            let z = z0 + oz;
            if wz == 0.0 || z < 0 || z >= nz as isize {
                continue;
            }
            for (oy, wy) in [(0, 1.0 - dy), (1, dy)] {
                let y = y0 + oy;
                if wy == 0.0 || y < 0 || y >= ny as isize {
                    continue;
                }
                let wzy = wz * wy;
                for (ox, wx) in [(0, 1.0 - dx), (1, dx)] {
                    let x = x0 + ox;
                    if wx == 0.0 || x < 0 || x >= nx as isize {
                        continue;
                    }
                    f([z as usize, y as usize, x as usize], wzy * wx);
                }
            }
        }
    }

    #[inline]
    pub(crate) fn sample(volume: &ArrayView3<f64>, index: &Vector3<f64>) -> f64 {
        let mut value = 0.0;
        Self::for_each_neighbour(volume.dim(), index, |idx, w| {
            value = volume[idx].mul_add(w, value);
        });
        value
    }

    /// Transpose of [`Interpolator::sample`]: distributes `value` onto the
    /// neighbours with the same weights.
    #[inline]
    pub(crate) fn splat(volume: &mut ArrayViewMut3<f64>, index: &Vector3<f64>, value: f64) {
        let shape = volume.dim();
        Self::for_each_neighbour(shape, index, |idx, w| {
            volume[idx] = value.mul_add(w, volume[idx]);
        });
    }

    /// Linearly resample `data` (placed by `source`) onto `target`. Voxels of
    /// the target whose centre falls outside the source footprint get
    /// `fill`.
    pub(crate) fn resample(
        data: &ArrayView3<f64>,
        source: &Geometry,
        target: &Geometry,
        fill: f64,
    ) -> Array3<f64> {
        // target index -> source index is affine: A·idx + b
        let linear = source.world_to_index_matrix() * target.index_to_world_matrix();
        let offset = source.world_to_index(target.origin());

        let mut out = Array3::<f64>::zeros(target.shape());
        Zip::indexed(&mut out).par_for_each(|(k, j, i), v| {
            let idx = linear * Vector3::new(i as f64, j as f64, k as f64) + offset;
            *v = if source.contains_index(&idx) {
                Self::sample(data, &Self::clamp_to_grid(source.shape(), &idx))
            } else {
                fill
            };
        });
        out
    }

    /// Clamp an index inside the footprint onto the sample lattice so that
    /// edge voxels are not attenuated by the zero padding.
    #[inline]
    pub(crate) fn clamp_to_grid(
        shape: (usize, usize, usize),
        index: &Vector3<f64>,
    ) -> Vector3<f64> {
        let (nz, ny, nx) = shape;
        Vector3::new(
            index.x.clamp(0.0, (nx - 1) as f64),
            index.y.clamp(0.0, (ny - 1) as f64),
            index.z.clamp(0.0, (nz - 1) as f64),
        )
    }
}
