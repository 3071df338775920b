//! Super-resolution reconstruction of a static volume from stacks of 2D
//! slices.
//!
//! Low-resolution stacks with known physical placement are combined into a
//! single isotropic high-resolution volume by solving
//!
//! ```text
//! min_x ½ ||y - A x||² + ½ α ||D x||²
//! ```
//!
//! with a matrix-free slice-acquisition operator `A`, a zeroth or first
//! order Tikhonov penalty `D` and an iterative least-squares minimizer.
//! Slice placements can be refined beforehand by hierarchical slice-to-volume
//! alignment.
//!
//! ```no_run
//! use srr_core::{ReconstructionConfig, TikhonovSolver};
//!
//! # fn main() -> srr_core::Result<()> {
//! let stacks = srr_core::io::load_directory("data/".as_ref(), "_mask")?;
//! let mut volume = stacks.stacks()[0].isotropically_resampled()?;
//! let mut solver = TikhonovSolver::new(stacks.into_stacks(), ReconstructionConfig::default())?;
//! solver.run_reconstruction(&mut volume)?;
//! # Ok(())
//! # }
//! ```

pub mod alignment;
pub mod config;
pub mod error;
pub mod estimate;
pub mod geometry;
pub(crate) mod interpolation;
pub mod io;
pub mod operator;
pub mod phantom;
pub mod registration;
pub mod slice;
pub mod solvers;
pub mod stack;
pub mod stack_manager;
pub mod tikhonov;
pub mod volume;

pub use alignment::HierarchicalSliceAlignment;
pub use config::{AlignmentConfig, ReconstructionConfig};
pub use error::{ReconError, Result};
pub use estimate::{ScatteredDataApproximation, StackAverage, VolumeEstimate, VolumeEstimator};
pub use geometry::{AffineTransform, Geometry};
pub use operator::{AcquisitionKernel, LinearOperator, Regularization, SliceAcquisition};
pub use registration::{RegistrationOptions, RegularStepGradientDescent, RigidRegistration};
pub use slice::Slice;
pub use solvers::{Minimizer, SolverOutcome, StopReason};
pub use stack::Stack;
pub use stack_manager::StackManager;
pub use tikhonov::{SolverStatistics, TikhonovSolver};
pub use volume::Volume;
