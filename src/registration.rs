//! Rigid registration of a slice group to a volume estimate.
//!
//! The alignment only depends on the [`RigidRegistration`] trait; the
//! bundled [`RegularStepGradientDescent`] minimises a mean-squares metric
//! over the six Euler parameters of a rigid transform.

use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReconError, Result};
use crate::geometry::AffineTransform;
use crate::interpolation::Interpolator;
use crate::stack::Stack;
use crate::volume::Volume;

/// Points per partial sum of the metric. Fixed so that the summation order
/// does not depend on the thread pool.
const METRIC_CHUNK: usize = 4096;

/// Parameter offset (mm of motion) of the central finite differences.
const FINITE_DIFFERENCE_STEP: f64 = 0.01;

/// Oracle returning the rigid transform that maps points of `fixed` into
/// the frame of `moving`: content at `p` in `fixed` belongs at `T(p)`.
pub trait RigidRegistration: Sync {
    fn register(&self, fixed: &Stack, moving: &Volume) -> Result<AffineTransform>;
}

/// Optimiser settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationOptions {
    /// Initial step length (mm of motion).
    pub learning_rate: f64,
    /// The optimisation stops once the step falls below this.
    pub min_step: f64,
    pub max_iterations: usize,
    /// Step factor applied whenever the gradient direction reverses.
    pub relaxation: f64,
    pub gradient_tolerance: f64,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            min_step: 0.05,
            max_iterations: 200,
            relaxation: 0.5,
            gradient_tolerance: 1e-8,
        }
    }
}

impl RegistrationOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ReconError::config("learning rate must be positive"));
        }
        if !(self.min_step.is_finite() && self.min_step > 0.0) {
            return Err(ReconError::config("minimum step must be positive"));
        }
        if !(self.relaxation > 0.0 && self.relaxation < 1.0) {
            return Err(ReconError::config("relaxation must lie in (0, 1)"));
        }
        if self.max_iterations == 0 {
            return Err(ReconError::config("max_iterations must be at least 1"));
        }
        Ok(())
    }
}

/// Regular-step gradient descent on a mean-squares metric.
///
/// Parameters are the Euler angles about the fixed stack's masked centroid
/// and a translation. Angles are scaled by the radius of the fixed sample
/// cloud so that every parameter step moves some point by about the step
/// length.
#[derive(Debug, Clone, Default)]
pub struct RegularStepGradientDescent {
    options: RegistrationOptions,
}

impl RegularStepGradientDescent {
    pub fn new(options: RegistrationOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &RegistrationOptions {
        &self.options
    }
}

type Parameters = [f64; 6];

/// Mean squared difference between fixed samples and the moving volume.
struct MeanSquares<'a> {
    points: Vec<Vector3<f64>>,
    values: Vec<f64>,
    moving: &'a Volume,
    center: Vector3<f64>,
    radius: f64,
}

impl<'a> MeanSquares<'a> {
    fn new(fixed: &Stack, moving: &'a Volume) -> Result<Self> {
        let volume = fixed.volume();
        let geometry = volume.geometry();
        let (points, values): (Vec<Vector3<f64>>, Vec<f64>) = volume
            .data()
            .indexed_iter()
            .filter(|(idx, _)| volume.mask()[*idx])
            .map(|((k, j, i), &v)| {
                (
                    geometry.index_to_world(&Vector3::new(i as f64, j as f64, k as f64)),
                    v,
                )
            })
            .unzip();
        if points.is_empty() {
            return Err(ReconError::registration(format!(
                "fixed stack '{}' has no masked voxels",
                fixed.name()
            )));
        }

        let center = points.iter().sum::<Vector3<f64>>() / points.len() as f64;
        let radius = points
            .iter()
            .map(|p| (p - center).norm())
            .fold(1.0, f64::max);
        Ok(Self {
            points,
            values,
            moving,
            center,
            radius,
        })
    }

    fn transform(&self, u: &Parameters) -> AffineTransform {
        AffineTransform::rigid(
            &(Vector3::new(u[0], u[1], u[2]) / self.radius),
            &Vector3::new(u[3], u[4], u[5]),
            &self.center,
        )
    }

    fn value(&self, u: &Parameters) -> Result<f64> {
        let transform = self.transform(u);
        let geometry = self.moving.geometry();
        let shape = geometry.shape();
        let data = self.moving.data().view();
        let mask = self.moving.mask();

        let partials: Vec<(f64, usize)> = self
            .points
            .par_chunks(METRIC_CHUNK)
            .zip(self.values.par_chunks(METRIC_CHUNK))
            .map(|(points, values)| {
                let mut sum = 0.0;
                let mut count = 0;
                for (p, &f) in points.iter().zip(values) {
                    let idx = geometry.world_to_index(&transform.apply_point(p));
                    if !geometry.contains_index(&idx) {
                        continue;
                    }
                    let idx = Interpolator::clamp_to_grid(shape, &idx);
                    let nearest = [
                        idx.z.round() as usize,
                        idx.y.round() as usize,
                        idx.x.round() as usize,
                    ];
                    if !mask[nearest] {
                        continue;
                    }
                    let diff = Interpolator::sample(&data, &idx) - f;
                    sum += diff * diff;
                    count += 1;
                }
                (sum, count)
            })
            .collect();

        let (sum, count) = partials
            .iter()
            .fold((0.0, 0), |(s, c), &(ps, pc)| (s + ps, c + pc));
        if count == 0 {
            return Err(ReconError::registration(
                "no fixed sample maps into the moving volume",
            ));
        }
        let value = sum / count as f64;
        if !value.is_finite() {
            return Err(ReconError::registration("metric is not finite"));
        }
        Ok(value)
    }

    fn gradient(&self, u: &Parameters) -> Result<Parameters> {
        let mut gradient = [0.0; 6];
        for (n, g) in gradient.iter_mut().enumerate() {
            let mut forward = *u;
            let mut backward = *u;
            forward[n] += FINITE_DIFFERENCE_STEP;
            backward[n] -= FINITE_DIFFERENCE_STEP;
            *g = (self.value(&forward)? - self.value(&backward)?) / (2.0 * FINITE_DIFFERENCE_STEP);
        }
        Ok(gradient)
    }
}

impl RigidRegistration for RegularStepGradientDescent {
    fn register(&self, fixed: &Stack, moving: &Volume) -> Result<AffineTransform> {
        let metric = MeanSquares::new(fixed, moving)?;
        let initial = metric.value(&[0.0; 6])?;

        let mut u: Parameters = [0.0; 6];
        let mut step = self.options.learning_rate;
        let mut previous: Option<Parameters> = None;
        let mut iterations = 0;
        while iterations < self.options.max_iterations {
            let gradient = metric.gradient(&u)?;
            let magnitude = gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
            if magnitude < self.options.gradient_tolerance {
                break;
            }
            if let Some(previous) = previous {
                let dot: f64 = gradient.iter().zip(&previous).map(|(a, b)| a * b).sum();
                if dot < 0.0 {
                    step *= self.options.relaxation;
                }
            }
            if step < self.options.min_step {
                break;
            }
            for (p, g) in u.iter_mut().zip(&gradient) {
                *p -= step * g / magnitude;
            }
            previous = Some(gradient);
            iterations += 1;
        }

        let final_value = metric.value(&u)?;
        debug!(
            fixed = fixed.name(),
            iterations,
            initial,
            final_value,
            "rigid registration"
        );
        Ok(metric.transform(&u))
    }
}
