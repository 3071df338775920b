//! Hierarchical slice-to-volume alignment.
//!
//! Each stack is split into its interleaved acquisition groups (slices
//! `g, g + step, …`). Every group is rigidly registered, as one block,
//! against a volume estimated from the other stacks, and the resulting
//! transform is applied to each slice of the group.

use std::time::Instant;

use nalgebra::Vector3;
use tracing::{debug, info};

use crate::config::AlignmentConfig;
use crate::error::{ReconError, Result};
use crate::estimate::VolumeEstimator;
use crate::geometry::{AffineTransform, Geometry};
use crate::registration::{RegularStepGradientDescent, RigidRegistration};
use crate::stack::Stack;
use crate::stack_manager::StackManager;
use crate::volume::Volume;

/// Tolerance on orthonormality of returned registration transforms.
const RIGIDITY_TOLERANCE: f64 = 1e-6;

pub struct HierarchicalSliceAlignment {
    estimator: Box<dyn VolumeEstimator>,
    registration: Box<dyn RigidRegistration>,
    step: usize,
}

impl HierarchicalSliceAlignment {
    pub fn new(
        estimator: Box<dyn VolumeEstimator>,
        registration: Box<dyn RigidRegistration>,
        step: usize,
    ) -> Result<Self> {
        if step == 0 {
            return Err(ReconError::config("alignment step must be at least 1"));
        }
        Ok(Self {
            estimator,
            registration,
            step,
        })
    }

    /// Alignment with the bundled estimator and registration selected by
    /// `config`.
    pub fn from_config(config: &AlignmentConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            config.volume_estimate.estimator(config.sigma, config.mask_voxels),
            Box::new(RegularStepGradientDescent::new(config.registration)?),
            config.step,
        )
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Align every stack of `stacks` in turn against an estimate on
    /// `target` built from all other stacks. A lone stack is aligned against
    /// its own estimate.
    pub fn run(&self, stacks: &mut StackManager, target: &Geometry) -> Result<()> {
        let start = Instant::now();
        for index in 0..stacks.len() {
            let estimate = {
                let others = if stacks.len() > 1 {
                    stacks.without(index)
                } else {
                    stacks.iter().collect()
                };
                self.estimator.estimate(&others, target)?
            };
            let stack = stacks
                .get_index_mut(index)
                .ok_or_else(|| ReconError::StackNotFound(format!("#{index}")))?;
            debug!(stack = stack.name(), "aligning stack");
            self.align_stack(stack, &estimate)?;
        }
        info!(
            stacks = stacks.len(),
            step = self.step,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "hierarchical slice alignment finished"
        );
        Ok(())
    }

    /// Register each interleaved group of `stack` to `estimate` and move its
    /// slices accordingly. Only slice transforms change.
    pub fn align_stack(&self, stack: &mut Stack, estimate: &Volume) -> Result<()> {
        for start in 0..self.step.min(stack.len()) {
            let indices = stack.group_indices(start, self.step);
            let group = stack.group(start, self.step)?;
            if group.masked_voxel_count() == 0 {
                debug!(group = group.name(), "group has no masked voxels, skipping");
                continue;
            }

            let transform = self.registration.register(&group, estimate)?;
            if !transform.is_rigid(RIGIDITY_TOLERANCE) {
                return Err(ReconError::registration(format!(
                    "transform for group '{}' is not rigid",
                    group.name()
                )));
            }
            debug!(
                group = group.name(),
                translation = ?transform.translation().as_slice(),
                "group registered"
            );

            for (member, &index) in indices.iter().enumerate() {
                let in_group = group
                    .geometry()
                    .index_to_world(&Vector3::new(0.0, 0.0, member as f64));
                let slice = &mut stack.slices_mut()[index];
                let offset = slice.geometry().origin() - in_group;
                slice.update_transform(&recentred(&transform, &offset))?;
            }
        }
        Ok(())
    }
}

/// `S(d) ∘ T ∘ S(-d)`: `transform` applied in a frame shifted by `offset`.
fn recentred(transform: &AffineTransform, offset: &Vector3<f64>) -> AffineTransform {
    AffineTransform::from_translation(*offset)
        .compose(transform)
        .compose(&AffineTransform::from_translation(-offset))
}
