//! Tikhonov-regularised super-resolution reconstruction.
//!
//! Minimises
//!
//! ```text
//! ½ ||y - A x||² + ½ α ||D x||²
//! ```
//!
//! where `A` is the slice-acquisition operator of all stacks, `y` the
//! observed slice pixels and `D` the TK0 or TK1 penalty. The problem is
//! handed to the minimizer as the single least-squares system
//! `[A; √α D] x ≈ [y; 0]`.

use std::time::{Duration, Instant};

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ReconstructionConfig;
use crate::error::{ReconError, Result};
use crate::operator::{AugmentedOperator, LinearOperator, SliceAcquisition};
use crate::solvers::StopReason;
use crate::stack::Stack;
use crate::volume::Volume;

/// Summary of one reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverStatistics {
    pub iterations: usize,
    pub stop_reason: StopReason,
    /// `||y - A x||` of the returned volume.
    pub residual_norm: f64,
    /// Objective value of the returned volume.
    pub objective: f64,
    pub observations: usize,
    pub elapsed: Duration,
}

/// SRR solver over a fixed set of stacks.
pub struct TikhonovSolver {
    stacks: Vec<Stack>,
    config: ReconstructionConfig,
    statistics: Option<SolverStatistics>,
}

impl TikhonovSolver {
    pub fn new(stacks: Vec<Stack>, config: ReconstructionConfig) -> Result<Self> {
        config.validate()?;
        if stacks.is_empty() {
            return Err(ReconError::EmptyInput(
                "at least one stack is required".to_string(),
            ));
        }
        Ok(Self {
            stacks,
            config,
            statistics: None,
        })
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    /// Statistics of the last call to [`TikhonovSolver::run_reconstruction`].
    pub fn statistics(&self) -> Option<&SolverStatistics> {
        self.statistics.as_ref()
    }

    /// Refine `volume` in place, warm-started from its current intensities.
    /// Geometry and mask of `volume` are left untouched.
    pub fn run_reconstruction(&mut self, volume: &mut Volume) -> Result<SolverStatistics> {
        let start = Instant::now();
        let hr = volume.geometry().clone();

        let acquisition = SliceAcquisition::new(&self.stacks, &hr, self.config.kernel);
        if acquisition.rows() == 0 {
            warn!("no slice pixel falls inside the reconstruction grid");
        }
        let penalty = self.config.regularization.operator(&hr);
        let system =
            AugmentedOperator::new(&acquisition, penalty.as_ref(), self.config.alpha.sqrt())?;
        let rhs = system.augment(acquisition.observations().view())?;

        info!(
            stacks = self.stacks.len(),
            observations = acquisition.rows(),
            unknowns = hr.len(),
            regularization = %self.config.regularization,
            minimizer = %self.config.minimizer,
            alpha = self.config.alpha,
            iter_max = self.config.iter_max,
            "starting SRR"
        );

        // solve for the update from the initial volume
        let x0: Array1<f64> = volume.data().iter().copied().collect();
        let shifted = &rhs - &system.apply(x0.view())?;
        let outcome = self
            .config
            .minimizer
            .solve(&system, shifted.view(), self.config.iter_max)?;
        if outcome.stop_reason == StopReason::IterationLimit {
            debug!(iterations = outcome.iterations, "minimizer stopped at iter_max");
        }
        let x = x0 + &outcome.x;

        let residual = &system.apply(x.view())? - &rhs;
        let data_residual = residual.slice(ndarray::s![..acquisition.rows()]);
        let statistics = SolverStatistics {
            iterations: outcome.iterations,
            stop_reason: outcome.stop_reason,
            residual_norm: data_residual.dot(&data_residual).sqrt(),
            objective: 0.5 * residual.dot(&residual),
            observations: acquisition.rows(),
            elapsed: start.elapsed(),
        };

        volume.set_data(x.into_shape(hr.shape())?)?;
        self.statistics = Some(statistics.clone());
        self.log_statistics();
        Ok(statistics)
    }

    /// Objective `½ ||y - A x||² + ½ α ||D x||²` of `volume`.
    pub fn objective(&self, volume: &Volume) -> Result<f64> {
        let hr = volume.geometry();
        let acquisition = SliceAcquisition::new(&self.stacks, hr, self.config.kernel);
        let penalty = self.config.regularization.operator(hr);
        let system =
            AugmentedOperator::new(&acquisition, penalty.as_ref(), self.config.alpha.sqrt())?;
        let rhs = system.augment(acquisition.observations().view())?;
        let x: Array1<f64> = volume.data().iter().copied().collect();
        let residual = &system.apply(x.view())? - &rhs;
        Ok(0.5 * residual.dot(&residual))
    }

    pub fn log_statistics(&self) {
        if let Some(stats) = &self.statistics {
            info!(
                iterations = stats.iterations,
                stop = %stats.stop_reason,
                residual = stats.residual_norm,
                objective = stats.objective,
                elapsed_ms = stats.elapsed.as_millis() as u64,
                "SRR finished"
            );
        }
    }

    /// File stem encoding the reconstruction setting, e.g.
    /// `SRR_stacks3_TK1_lsmr_alpha0.02_itermax10`.
    pub fn setting_specific_filename(&self, prefix: &str) -> String {
        format!(
            "{prefix}stacks{}_{}_{}_alpha{}_itermax{}",
            self.stacks.len(),
            self.config.regularization,
            self.config.minimizer,
            self.config.alpha,
            self.config.iter_max
        )
    }
}
