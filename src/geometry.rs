//! Physical placement of voxel grids and the affine transforms acting on them.
//!
//! Arrays are indexed `[k, j, i]` (slice, row, column). A continuous index
//! `(i, j, k)` maps to physical space as
//!
//! ```text
//! p = origin + direction · diag(spacing) · (i, j, k)ᵀ
//! ```
//!
//! where the columns of `direction` are the unit axes of `i`, `j` and `k`.

use nalgebra::{Matrix3, Rotation3, Vector3};

use crate::error::{ReconError, Result};

/// Placement of a 3D voxel grid in physical (mm) space.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    shape: (usize, usize, usize),
    origin: Vector3<f64>,
    direction: Matrix3<f64>,
    spacing: Vector3<f64>,
    index_to_world: Matrix3<f64>,
    world_to_index: Matrix3<f64>,
}

impl Geometry {
    /// Create a geometry. `shape` is `(nz, ny, nx)`, `spacing` is given
    /// along `(i, j, k)`.
    pub fn new(
        shape: (usize, usize, usize),
        origin: Vector3<f64>,
        direction: Matrix3<f64>,
        spacing: Vector3<f64>,
    ) -> Result<Self> {
        if shape.0 == 0 || shape.1 == 0 || shape.2 == 0 {
            return Err(ReconError::geometry(format!("zero extent in shape {shape:?}")));
        }
        if spacing.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(ReconError::geometry(format!(
                "spacing must be positive, got {:?}",
                spacing.as_slice()
            )));
        }
        if origin.iter().chain(direction.iter()).any(|v| !v.is_finite()) {
            return Err(ReconError::geometry("non-finite origin or direction"));
        }

        let index_to_world = direction * Matrix3::from_diagonal(&spacing);
        let world_to_index = index_to_world
            .try_inverse()
            .ok_or_else(|| ReconError::geometry("direction matrix is singular"))?;

        Ok(Self {
            shape,
            origin,
            direction,
            spacing,
            index_to_world,
            world_to_index,
        })
    }

    /// Axis-aligned grid with its first voxel at the physical origin.
    pub fn axis_aligned(shape: (usize, usize, usize), spacing: Vector3<f64>) -> Result<Self> {
        Self::new(shape, Vector3::zeros(), Matrix3::identity(), spacing)
    }

    /// `(nz, ny, nx)`
    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn origin(&self) -> &Vector3<f64> {
        &self.origin
    }

    pub fn direction(&self) -> &Matrix3<f64> {
        &self.direction
    }

    pub fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.shape.0 * self.shape.1 * self.shape.2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `direction · diag(spacing)`
    pub fn index_to_world_matrix(&self) -> &Matrix3<f64> {
        &self.index_to_world
    }

    pub fn world_to_index_matrix(&self) -> &Matrix3<f64> {
        &self.world_to_index
    }

    /// Physical point of a continuous `(i, j, k)` index.
    pub fn index_to_world(&self, index: &Vector3<f64>) -> Vector3<f64> {
        self.origin + self.index_to_world * index
    }

    /// Continuous `(i, j, k)` index of a physical point.
    pub fn world_to_index(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.world_to_index * (point - self.origin)
    }

    /// Whether a continuous index falls inside the grid's voxel footprint,
    /// i.e. `-0.5 <= idx < n - 0.5` along every axis.
    pub fn contains_index(&self, index: &Vector3<f64>) -> bool {
        let (nz, ny, nx) = self.shape;
        let inside = |v: f64, n: usize| v >= -0.5 && v < n as f64 - 0.5;
        inside(index.x, nx) && inside(index.y, ny) && inside(index.z, nz)
    }

    /// Physical centre of the grid.
    pub fn center(&self) -> Vector3<f64> {
        let (nz, ny, nx) = self.shape;
        let mid = Vector3::new(
            (nx as f64 - 1.0) / 2.0,
            (ny as f64 - 1.0) / 2.0,
            (nz as f64 - 1.0) / 2.0,
        );
        self.index_to_world(&mid)
    }

    /// Same grid moved by `transform` in the world frame.
    pub fn transformed(&self, transform: &AffineTransform) -> Result<Self> {
        Self::new(
            self.shape,
            transform.apply_point(&self.origin),
            transform.linear() * self.direction,
            self.spacing,
        )
    }

    /// Grid with the same origin and orientation covering the same physical
    /// extent with isotropic voxels of size `spacing`.
    pub fn isotropic(&self, spacing: f64) -> Result<Self> {
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(ReconError::geometry(format!(
                "isotropic spacing must be positive, got {spacing}"
            )));
        }
        let (nz, ny, nx) = self.shape;
        let resize = |n: usize, s: f64| ((n as f64 * s / spacing).round() as usize).max(1);
        Self::new(
            (
                resize(nz, self.spacing.z),
                resize(ny, self.spacing.y),
                resize(nx, self.spacing.x),
            ),
            self.origin,
            self.direction,
            Vector3::repeat(spacing),
        )
    }

    /// Sub-grid of `shape` voxels whose first voxel is voxel `start`
    /// (`[k, j, i]`) of this grid.
    pub fn cropped(&self, start: [usize; 3], shape: (usize, usize, usize)) -> Result<Self> {
        let (nz, ny, nx) = self.shape;
        if start[0] + shape.0 > nz || start[1] + shape.1 > ny || start[2] + shape.2 > nx {
            return Err(ReconError::geometry(format!(
                "crop of {shape:?} voxels at {start:?} exceeds grid {:?}",
                self.shape
            )));
        }
        let origin = self.index_to_world(&Vector3::new(
            start[2] as f64,
            start[1] as f64,
            start[0] as f64,
        ));
        Self::new(shape, origin, self.direction, self.spacing)
    }

    pub fn with_shape(&self, shape: (usize, usize, usize)) -> Result<Self> {
        Self::new(shape, self.origin, self.direction, self.spacing)
    }

    pub fn with_origin(&self, origin: Vector3<f64>) -> Result<Self> {
        Self::new(self.shape, origin, self.direction, self.spacing)
    }

    pub fn with_spacing(&self, spacing: Vector3<f64>) -> Result<Self> {
        Self::new(self.shape, self.origin, self.direction, spacing)
    }
}

/// Affine map `p' = linear · p + translation` acting on physical points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    linear: Matrix3<f64>,
    translation: Vector3<f64>,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    pub fn new(linear: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            linear,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity(), Vector3::zeros())
    }

    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self::new(Matrix3::identity(), translation)
    }

    /// Rigid transform rotating about `center` by Euler angles
    /// `(rx, ry, rz)` (radians, `R = Rz · Ry · Rx`) followed by
    /// `translation`: `p' = R (p - c) + c + t`.
    pub fn rigid(angles: &Vector3<f64>, translation: &Vector3<f64>, center: &Vector3<f64>) -> Self {
        let rotation = Rotation3::from_euler_angles(angles.x, angles.y, angles.z).into_inner();
        Self::new(rotation, center - rotation * center + translation)
    }

    pub fn linear(&self) -> &Matrix3<f64> {
        &self.linear
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    pub fn apply_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.linear * point + self.translation
    }

    pub fn apply_vector(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.linear * vector
    }

    /// `self ∘ other`: `other` is applied first.
    pub fn compose(&self, other: &AffineTransform) -> AffineTransform {
        AffineTransform::new(
            self.linear * other.linear,
            self.linear * other.translation + self.translation,
        )
    }

    pub fn inverse(&self) -> Option<AffineTransform> {
        let inv = self.linear.try_inverse()?;
        Some(AffineTransform::new(inv, -(inv * self.translation)))
    }

    /// Orthonormal linear part with determinant +1.
    pub fn is_rigid(&self, tol: f64) -> bool {
        let gram = self.linear.transpose() * self.linear;
        let orthonormal = (gram - Matrix3::identity()).amax() <= tol;
        orthonormal
            && (self.linear.determinant() - 1.0).abs() <= tol
            && self.translation.iter().all(|t| t.is_finite())
    }
}
