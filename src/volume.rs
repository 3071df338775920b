use ndarray::{s, Array3, Zip};

use crate::error::{ReconError, Result};
use crate::geometry::Geometry;
use crate::interpolation::Interpolator;

/// Intensity grid with its mask and physical placement.
///
/// Used both as the 3D image a [`Stack`](crate::stack::Stack) was sliced from
/// and as the high-resolution reconstruction target.
#[derive(Debug, Clone)]
pub struct Volume {
    name: String,
    geometry: Geometry,
    data: Array3<f64>,
    mask: Array3<bool>,
}

impl Volume {
    pub fn new(
        name: impl Into<String>,
        data: Array3<f64>,
        mask: Array3<bool>,
        geometry: Geometry,
    ) -> Result<Self> {
        let (nz, ny, nx) = geometry.shape();
        let expected = [nz, ny, nx];
        if data.shape() != expected {
            return Err(ReconError::shape(&expected, data.shape()));
        }
        if mask.shape() != expected {
            return Err(ReconError::shape(&expected, mask.shape()));
        }
        Ok(Self {
            name: name.into(),
            geometry,
            data,
            mask,
        })
    }

    /// Caller guarantees `data` and `mask` have the shape of `geometry`.
    pub(crate) fn from_parts(
        name: String,
        geometry: Geometry,
        data: Array3<f64>,
        mask: Array3<bool>,
    ) -> Self {
        debug_assert_eq!(data.dim(), geometry.shape());
        debug_assert_eq!(mask.dim(), geometry.shape());
        Self {
            name,
            geometry,
            data,
            mask,
        }
    }

    /// Volume with a mask covering the whole grid.
    pub fn from_data(
        name: impl Into<String>,
        data: Array3<f64>,
        geometry: Geometry,
    ) -> Result<Self> {
        let mask = Array3::from_elem(data.dim(), true);
        Self::new(name, data, mask, geometry)
    }

    pub fn zeros(name: impl Into<String>, geometry: Geometry) -> Self {
        let shape = geometry.shape();
        Self {
            name: name.into(),
            geometry,
            data: Array3::zeros(shape),
            mask: Array3::from_elem(shape, true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// `(nz, ny, nx)`
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<f64> {
        &mut self.data
    }

    pub fn mask(&self) -> &Array3<bool> {
        &self.mask
    }

    /// Replace the intensities, keeping geometry and mask.
    pub fn set_data(&mut self, data: Array3<f64>) -> Result<()> {
        if data.dim() != self.data.dim() {
            let (nz, ny, nx) = self.data.dim();
            return Err(ReconError::shape(&[nz, ny, nx], data.shape()));
        }
        self.data = data;
        Ok(())
    }

    pub fn masked_voxel_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Crop to the index bounding box of the mask. Geometry keeps the
    /// orientation and spacing; the origin moves to the first kept voxel.
    pub fn cropped_to_mask(&self) -> Result<Volume> {
        let mut lo = [usize::MAX; 3];
        let mut hi = [0; 3];
        for ((k, j, i), _) in self.mask.indexed_iter().filter(|(_, m)| **m) {
            for (axis, index) in [k, j, i].into_iter().enumerate() {
                lo[axis] = lo[axis].min(index);
                hi[axis] = hi[axis].max(index);
            }
        }
        if lo[0] == usize::MAX {
            return Err(ReconError::EmptyInput(format!(
                "mask of '{}' is empty, nothing to crop to",
                self.name
            )));
        }

        let shape = (hi[0] - lo[0] + 1, hi[1] - lo[1] + 1, hi[2] - lo[2] + 1);
        let geometry = self.geometry.cropped(lo, shape)?;
        let region = s![lo[0]..=hi[0], lo[1]..=hi[1], lo[2]..=hi[2]];
        Ok(Self::from_parts(
            self.name.clone(),
            geometry,
            self.data.slice(region).to_owned(),
            self.mask.slice(region).to_owned(),
        ))
    }

    /// Linear resampling of intensities and mask onto `target`. The mask is
    /// interpolated as a fraction and thresholded at one half.
    pub fn resampled_onto(&self, target: &Geometry) -> Volume {
        let data = Interpolator::resample(&self.data.view(), &self.geometry, target, 0.0);
        let mask_fraction = self.mask.mapv(|m| if m { 1.0 } else { 0.0 });
        let fraction = Interpolator::resample(&mask_fraction.view(), &self.geometry, target, 0.0);
        let mut mask = Array3::from_elem(target.shape(), false);
        Zip::from(&mut mask)
            .and(&fraction)
            .for_each(|m, &f| *m = f >= 0.5);

        Volume::from_parts(self.name.clone(), target.clone(), data, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn rejects_mismatched_arrays() {
        let geometry = Geometry::axis_aligned((2, 3, 4), Vector3::repeat(1.0)).unwrap();
        let err = Volume::from_data("v", Array3::zeros((2, 4, 3)), geometry).unwrap_err();
        assert!(matches!(err, ReconError::ShapeMismatch { .. }));
    }

    #[test]
    fn set_data_keeps_shape() {
        let geometry = Geometry::axis_aligned((2, 2, 2), Vector3::repeat(1.0)).unwrap();
        let mut volume = Volume::zeros("v", geometry);
        assert!(volume.set_data(Array3::ones((2, 2, 2))).is_ok());
        assert!(volume.set_data(Array3::ones((2, 2, 3))).is_err());
        assert_eq!(volume.data().sum(), 8.0);
    }

    #[test]
    fn cropping_follows_mask_bounds() {
        let geometry = Geometry::axis_aligned((4, 4, 4), Vector3::repeat(2.0)).unwrap();
        let data = Array3::from_shape_fn((4, 4, 4), |(k, j, i)| (16 * k + 4 * j + i) as f64);
        let mut mask = Array3::from_elem((4, 4, 4), false);
        mask[[1, 0, 2]] = true;
        mask[[2, 0, 3]] = true;
        let volume = Volume::new("v", data, mask, geometry).unwrap();

        let cropped = volume.cropped_to_mask().unwrap();
        assert_eq!(cropped.dim(), (2, 1, 2));
        assert_eq!(cropped.geometry().origin(), &Vector3::new(4.0, 0.0, 2.0));
        assert_eq!(cropped.geometry().spacing(), volume.geometry().spacing());
        assert_eq!(cropped.data()[[0, 0, 0]], volume.data()[[1, 0, 2]]);
        assert_eq!(cropped.data()[[1, 0, 1]], volume.data()[[2, 0, 3]]);
        assert_eq!(cropped.masked_voxel_count(), 2);
        // a voxel keeps its physical position
        let p = cropped.geometry().index_to_world(&Vector3::new(1.0, 0.0, 1.0));
        assert_eq!(p, volume.geometry().index_to_world(&Vector3::new(3.0, 0.0, 2.0)));
    }

    #[test]
    fn cropping_an_empty_mask_fails() {
        let geometry = Geometry::axis_aligned((2, 2, 2), Vector3::repeat(1.0)).unwrap();
        let volume =
            Volume::new("v", Array3::ones((2, 2, 2)), Array3::from_elem((2, 2, 2), false), geometry)
                .unwrap();
        assert!(matches!(volume.cropped_to_mask(), Err(ReconError::EmptyInput(_))));
    }

    #[test]
    fn resampling_to_finer_grid_keeps_mask_region() {
        let geometry = Geometry::axis_aligned((4, 4, 4), Vector3::repeat(2.0)).unwrap();
        let mut mask = Array3::from_elem((4, 4, 4), false);
        mask[[1, 1, 1]] = true;
        let volume = Volume::new("v", Array3::ones((4, 4, 4)), mask, geometry.clone()).unwrap();
        let fine = volume.resampled_onto(&geometry.isotropic(1.0).unwrap());
        assert_eq!(fine.dim(), (8, 8, 8));
        assert!(fine.mask()[[2, 2, 2]]);
        assert!(!fine.mask()[[6, 6, 6]]);
    }
}
