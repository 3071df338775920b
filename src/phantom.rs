//! Synthetic ground truth and simulated low-resolution acquisitions.

use nalgebra::{Rotation3, Vector3};
use ndarray::{Array3, Zip};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReconError, Result};
use crate::geometry::Geometry;
use crate::operator::{AcquisitionKernel, LinearOperator, SliceAcquisition};
use crate::stack::Stack;
use crate::volume::Volume;

/// Ellipsoid in coordinates normalised to the grid's half extent, so
/// `[-1, 1]³` spans the field of view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    pub center: Vector3<f64>,
    pub radii: Vector3<f64>,
    /// Euler angles (radians) of the ellipsoid axes.
    pub angles: Vector3<f64>,
    pub intensity: f64,
}

/// Sum of soft-edged ellipsoids.
#[derive(Debug, Clone, PartialEq)]
pub struct Phantom {
    pub ellipsoids: Vec<Ellipsoid>,
    /// Width (mm) of the linear ramp at each ellipsoid surface.
    pub edge: f64,
}

impl Phantom {
    /// Head-like phantom: skull, brain, ventricles and a few lesions.
    pub fn head() -> Self {
        let e = |c: [f64; 3], r: [f64; 3], a: [f64; 3], intensity: f64| Ellipsoid {
            center: Vector3::from(c),
            radii: Vector3::from(r),
            angles: Vector3::from(a),
            intensity,
        };
        Self {
            ellipsoids: vec![
                e([0.0, 0.0, 0.0], [0.72, 0.86, 0.8], [0.0, 0.0, 0.0], 1.0),
                e([0.0, -0.02, 0.0], [0.66, 0.8, 0.74], [0.0, 0.0, 0.0], -0.6),
                e([0.18, 0.0, 0.05], [0.12, 0.32, 0.2], [0.0, 0.0, -0.3], -0.2),
                e([-0.18, 0.0, 0.05], [0.14, 0.36, 0.22], [0.0, 0.0, 0.3], -0.2),
                e([0.0, 0.35, -0.2], [0.2, 0.2, 0.2], [0.0, 0.0, 0.0], 0.15),
                e([-0.1, -0.5, 0.3], [0.08, 0.06, 0.1], [0.4, 0.0, 0.0], 0.3),
                e([0.25, -0.3, -0.35], [0.07, 0.07, 0.07], [0.0, 0.0, 0.0], 0.3),
            ],
            edge: 2.0,
        }
    }

    /// Sample the phantom on `geometry`.
    pub fn render(&self, geometry: &Geometry) -> Volume {
        let center = geometry.center();
        let (nz, ny, nx) = geometry.shape();
        let spacing = geometry.spacing();
        let half = Vector3::new(
            nx as f64 * spacing.x,
            ny as f64 * spacing.y,
            nz as f64 * spacing.z,
        ) / 2.0;
        // (world -> grid axes) rotation
        let to_grid = geometry.direction().transpose();

        let shapes: Vec<(Rotation3<f64>, Vector3<f64>, Vector3<f64>, f64, f64)> = self
            .ellipsoids
            .iter()
            .map(|e| {
                let radii = e.radii.component_mul(&half);
                (
                    Rotation3::from_euler_angles(e.angles.x, e.angles.y, e.angles.z).inverse(),
                    e.center.component_mul(&half),
                    radii,
                    radii.min(),
                    e.intensity,
                )
            })
            .collect();

        let mut data = Array3::<f64>::zeros(geometry.shape());
        Zip::indexed(&mut data).par_for_each(|(k, j, i), value| {
            let p = geometry.index_to_world(&Vector3::new(i as f64, j as f64, k as f64));
            let local = to_grid * (p - center);
            *value = shapes
                .iter()
                .map(|(to_axes, c, radii, r_min, intensity)| {
                    let q = to_axes * (local - c);
                    let r = q.component_div(radii).norm();
                    let weight = ((1.0 - r) * r_min / self.edge + 0.5).clamp(0.0, 1.0);
                    intensity * weight
                })
                .sum();
        });
        let mask = Array3::from_elem(geometry.shape(), true);
        Volume::from_parts("phantom".to_string(), geometry.clone(), data, mask)
    }
}

/// Settings of the acquisition simulation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub stacks: usize,
    pub in_plane_spacing: f64,
    pub slice_thickness: f64,
    /// Standard deviation of additive Gaussian noise.
    pub noise_sigma: f64,
    pub seed: u64,
    pub kernel: AcquisitionKernel,
    /// Length (mm) of the translation of each stack's centre away from the
    /// truth's centre. Directions follow [`stack_offset`].
    pub offset: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            stacks: 3,
            in_plane_spacing: 1.0,
            slice_thickness: 3.0,
            noise_sigma: 0.0,
            seed: 0,
            kernel: AcquisitionKernel::OrientedGaussian,
            offset: 0.0,
        }
    }
}

/// Orientation of the `index`-th simulated stack: axial, coronal and
/// sagittal for the first three, oblique after that. A small tilt keeps
/// the stacks from sharing sample positions.
pub fn stack_orientation(index: usize) -> Rotation3<f64> {
    use std::f64::consts::FRAC_PI_2;
    let tilt = 0.05 * (index as f64 + 1.0);
    let base = match index {
        0 => Rotation3::identity(),
        1 => Rotation3::from_euler_angles(FRAC_PI_2, 0.0, 0.0),
        2 => Rotation3::from_euler_angles(0.0, FRAC_PI_2, 0.0),
        n => Rotation3::from_euler_angles(0.4 * n as f64, 0.7 * n as f64, 0.3 * n as f64),
    };
    base * Rotation3::from_euler_angles(tilt, -tilt, 0.5 * tilt)
}

/// Translation of the `index`-th simulated stack's centre, of length
/// `magnitude`. Consecutive stacks move in different directions.
pub fn stack_offset(index: usize, magnitude: f64) -> Vector3<f64> {
    let phase = 0.3 + index as f64 * 2.0 * std::f64::consts::FRAC_PI_3;
    let tilt = if index % 2 == 0 { 0.5 } else { -0.5 };
    Vector3::new(phase.cos(), phase.sin(), tilt).normalize() * magnitude
}

/// Geometry of a stack with the given orientation covering `truth`, its
/// centre moved by `offset`.
fn stack_geometry(
    truth: &Geometry,
    direction: Rotation3<f64>,
    offset: Vector3<f64>,
    settings: &SimulationSettings,
) -> Result<Geometry> {
    let (nz, ny, nx) = truth.shape();
    let spacing = truth.spacing();
    let extent = (nx as f64 * spacing.x)
        .max(ny as f64 * spacing.y)
        .max(nz as f64 * spacing.z);
    let count = |s: f64| ((extent / s).ceil() as usize).max(1);
    let stack_spacing = Vector3::new(
        settings.in_plane_spacing,
        settings.in_plane_spacing,
        settings.slice_thickness,
    );
    let shape = (
        count(settings.slice_thickness),
        count(settings.in_plane_spacing),
        count(settings.in_plane_spacing),
    );
    let half = Vector3::new(
        (shape.2 as f64 - 1.0) / 2.0,
        (shape.1 as f64 - 1.0) / 2.0,
        (shape.0 as f64 - 1.0) / 2.0,
    );
    let direction = direction.into_inner();
    let origin = truth.center() + offset - direction * stack_spacing.component_mul(&half);
    Geometry::new(shape, origin, direction, stack_spacing)
}

/// Simulate `settings.stacks` low-resolution stacks of `truth` through the
/// slice-acquisition model. Pixels outside the truth's grid are masked out.
pub fn simulate_stacks(truth: &Volume, settings: &SimulationSettings) -> Result<Vec<Stack>> {
    if settings.stacks == 0 {
        return Err(ReconError::config("at least one stack must be simulated"));
    }
    if !(settings.noise_sigma.is_finite() && settings.noise_sigma >= 0.0) {
        return Err(ReconError::config("noise sigma must be non-negative"));
    }
    if !(settings.offset.is_finite() && settings.offset >= 0.0) {
        return Err(ReconError::config("stack offset must be non-negative"));
    }
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let x: ndarray::Array1<f64> = truth.data().iter().copied().collect();

    (0..settings.stacks)
        .map(|s| {
            let name = format!("stack{s}");
            let geometry = stack_geometry(
                truth.geometry(),
                stack_orientation(s),
                stack_offset(s, settings.offset),
                settings,
            )?;
            let template =
                Stack::from_volume(&name, Array3::zeros(geometry.shape()), None, geometry.clone())?;

            let op = SliceAcquisition::new(&[template], truth.geometry(), settings.kernel);
            let y = op.apply(x.view())?;

            let mut data = Array3::<f64>::zeros(geometry.shape());
            let mut mask = Array3::from_elem(geometry.shape(), false);
            for ((_, k, [j, i]), value) in op.row_pixels().zip(y.iter()) {
                data[[k, j, i]] = *value;
                mask[[k, j, i]] = true;
            }
            if settings.noise_sigma > 0.0 {
                let normal = Normal::new(0.0, settings.noise_sigma)
                    .map_err(|e| ReconError::config(e.to_string()))?;
                let noise = Array3::random_using(geometry.shape(), normal, &mut rng);
                Zip::from(&mut data)
                    .and(&noise)
                    .and(&mask)
                    .for_each(|v, &n, &m| {
                        if m {
                            *v += n;
                        }
                    });
            }
            debug!(stack = %name, shape = ?geometry.shape(), rows = op.rows(), "simulated stack");
            Stack::from_volume(name, data, Some(mask), geometry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truth() -> Volume {
        let geometry = Geometry::axis_aligned((16, 16, 16), Vector3::repeat(1.0)).unwrap();
        Phantom::head().render(&geometry)
    }

    #[test]
    fn phantom_has_contrast_inside_and_zero_outside() {
        let volume = truth();
        assert_eq!(volume.data()[[0, 0, 0]], 0.0);
        let centre = volume.data()[[8, 8, 8]];
        assert!(centre > 0.1 && centre < 1.0, "centre value {centre}");
        let max = volume.data().iter().cloned().fold(f64::MIN, f64::max);
        assert!(max <= 1.0 + 1e-12);
    }

    #[test]
    fn orientations_are_distinct_rotations() {
        for s in 0..5 {
            let r = stack_orientation(s).into_inner();
            assert!(((r.transpose() * r) - nalgebra::Matrix3::identity()).amax() < 1e-12);
        }
        let axial = stack_orientation(0).into_inner();
        let coronal = stack_orientation(1).into_inner();
        assert!(axial.column(2).dot(&coronal.column(2)).abs() < 0.2);
    }

    #[test]
    fn simulated_stacks_cover_the_phantom() {
        let truth = truth();
        let settings = SimulationSettings {
            slice_thickness: 2.0,
            ..Default::default()
        };
        let stacks = simulate_stacks(&truth, &settings).unwrap();
        assert_eq!(stacks.len(), 3);
        for stack in &stacks {
            assert_eq!(stack.geometry().spacing().z, 2.0);
            assert!(stack.masked_voxel_count() > 0);
            // simulated values are local averages of the phantom
            let max = stack.volume().data().iter().cloned().fold(f64::MIN, f64::max);
            assert!(max <= 1.0 + 1e-9);
        }
        // simulation reproduces the operator's observations
        let op = SliceAcquisition::new(&stacks, truth.geometry(), settings.kernel);
        let x: ndarray::Array1<f64> = truth.data().iter().copied().collect();
        let y = op.apply(x.view()).unwrap();
        let diff = (&y - op.observations()).mapv(f64::abs).fold(0.0, |a: f64, &b| a.max(b));
        assert!(diff < 1e-12);
    }

    #[test]
    fn stacks_are_moved_by_their_offsets() {
        let truth = truth();
        let settings = SimulationSettings {
            offset: 2.5,
            ..Default::default()
        };
        let stacks = simulate_stacks(&truth, &settings).unwrap();
        for (s, stack) in stacks.iter().enumerate() {
            let shift = stack.geometry().center() - truth.geometry().center();
            assert!((shift - stack_offset(s, 2.5)).norm() < 1e-9);
            assert!((shift.norm() - 2.5).abs() < 1e-9);
            assert!(stack.masked_voxel_count() > 0);
        }
        let first = stack_offset(0, 1.0);
        assert!((first - stack_offset(1, 1.0)).norm() > 0.5);
        assert_eq!(stack_offset(2, 0.0), Vector3::zeros());
    }

    #[test]
    fn noise_is_seeded() {
        let truth = truth();
        let settings = SimulationSettings {
            stacks: 1,
            noise_sigma: 0.05,
            seed: 42,
            ..Default::default()
        };
        let a = simulate_stacks(&truth, &settings).unwrap();
        let b = simulate_stacks(&truth, &settings).unwrap();
        assert_eq!(a[0].volume().data(), b[0].volume().data());
        let clean = simulate_stacks(&truth, &SimulationSettings { noise_sigma: 0.0, ..settings }).unwrap();
        assert_ne!(a[0].volume().data(), clean[0].volume().data());
    }

    #[test]
    fn rejects_invalid_settings() {
        let truth = truth();
        let none = SimulationSettings {
            stacks: 0,
            ..Default::default()
        };
        assert!(simulate_stacks(&truth, &none).is_err());
        let negative = SimulationSettings {
            offset: -1.0,
            ..Default::default()
        };
        assert!(simulate_stacks(&truth, &negative).is_err());
    }
}
