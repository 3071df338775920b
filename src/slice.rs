use ndarray::Array2;

use crate::error::{ReconError, Result};
use crate::geometry::{AffineTransform, Geometry};

/// One 2D image of a stack with its own physical placement.
///
/// The base placement is fixed at load time. Registration corrections are
/// accumulated in `transform`, which acts in the world frame: the effective
/// placement is `transform` applied to the base placement.
#[derive(Debug, Clone)]
pub struct Slice {
    stack_id: String,
    index: usize,
    data: Array2<f64>,
    mask: Array2<bool>,
    base_geometry: Geometry,
    transform: AffineTransform,
    geometry: Geometry,
}

impl Slice {
    /// `geometry` must have shape `(1, ny, nx)` with the slice thickness as
    /// its third spacing component.
    pub fn new(
        stack_id: impl Into<String>,
        index: usize,
        data: Array2<f64>,
        mask: Option<Array2<bool>>,
        geometry: Geometry,
    ) -> Result<Self> {
        let (nz, ny, nx) = geometry.shape();
        if nz != 1 || data.dim() != (ny, nx) {
            return Err(ReconError::shape(&[1, ny, nx], &[1, data.nrows(), data.ncols()]));
        }
        let mask = match mask {
            Some(mask) if mask.dim() != data.dim() => {
                return Err(ReconError::shape(&[ny, nx], mask.shape()));
            }
            Some(mask) => mask,
            None => Array2::from_elem(data.dim(), true),
        };
        Ok(Self {
            stack_id: stack_id.into(),
            index,
            data,
            mask,
            geometry: geometry.clone(),
            base_geometry: geometry,
            transform: AffineTransform::identity(),
        })
    }

    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Pixel intensities indexed `[j, i]`.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    /// Placement at load time.
    pub fn base_geometry(&self) -> &Geometry {
        &self.base_geometry
    }

    /// Current placement: the accumulated transform applied to the base
    /// placement.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn transform(&self) -> &AffineTransform {
        &self.transform
    }

    /// Replace the accumulated transform.
    pub fn set_transform(&mut self, transform: AffineTransform) -> Result<()> {
        self.geometry = self.base_geometry.transformed(&transform)?;
        self.transform = transform;
        Ok(())
    }

    /// Compose `correction` on the left of the accumulated transform, i.e.
    /// apply it in the world frame after all previous corrections.
    pub fn update_transform(&mut self, correction: &AffineTransform) -> Result<()> {
        self.set_transform(correction.compose(&self.transform))
    }

    pub fn masked_pixel_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    pub fn has_masked_pixels(&self) -> bool {
        self.mask.iter().any(|&m| m)
    }
}
