//! Iterative least-squares minimizers for `min ||A x - b||₂`.
//!
//! Both solvers only touch `A` through [`LinearOperator`] callbacks:
//! - LSMR: least squares minimal residual
//! - CGLS: conjugate gradients on the normal equations

pub mod cgls;
pub mod lsmr;

pub use cgls::cgls_solve;
pub use lsmr::{lsmr_solve, LsmrOptions};

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};
use crate::operator::LinearOperator;

/// Choice of iterative least-squares minimizer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Minimizer {
    #[default]
    Lsmr,
    Cgls,
}

impl Minimizer {
    /// Run at most `max_iter` iterations on `min ||A x - b||`, starting at
    /// `x = 0`.
    pub fn solve(
        &self,
        op: &dyn LinearOperator,
        b: ArrayView1<f64>,
        max_iter: usize,
    ) -> Result<SolverOutcome> {
        match self {
            Minimizer::Lsmr => lsmr_solve(op, b, &LsmrOptions::with_max_iter(max_iter)),
            Minimizer::Cgls => cgls_solve(op, b, 1e-6, max_iter),
        }
    }
}

impl fmt::Display for Minimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Minimizer::Lsmr => write!(f, "lsmr"),
            Minimizer::Cgls => write!(f, "cgls"),
        }
    }
}

impl FromStr for Minimizer {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lsmr" => Ok(Minimizer::Lsmr),
            "cgls" => Ok(Minimizer::Cgls),
            other => Err(ReconError::config(format!(
                "unknown minimizer '{other}', expected lsmr or cgls"
            ))),
        }
    }
}

/// Why an iterative solver stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `x = 0` already solves the problem.
    ZeroSolution,
    /// `||r||` is small enough: `A x = b` is solved to tolerance.
    ResidualTolerance,
    /// `||Aᵀ r||` is small enough: least-squares optimum to tolerance.
    LeastSquaresTolerance,
    /// The estimated condition number exceeded its limit.
    ConditionLimit,
    /// A tolerance dropped below machine precision.
    MachinePrecision,
    /// The iteration cap was reached first.
    IterationLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::ZeroSolution => "x = 0 is the exact solution",
            StopReason::ResidualTolerance => "residual below tolerance",
            StopReason::LeastSquaresTolerance => "least-squares optimality reached",
            StopReason::ConditionLimit => "condition number limit reached",
            StopReason::MachinePrecision => "machine precision reached",
            StopReason::IterationLimit => "iteration limit reached",
        };
        f.write_str(text)
    }
}

/// Result of an iterative solve.
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub x: Array1<f64>,
    pub iterations: usize,
    pub stop_reason: StopReason,
    /// Estimate of `||b - A x||`.
    pub residual_norm: f64,
}

#[inline]
pub(crate) fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimizer_names() {
        assert_eq!("LSMR".parse::<Minimizer>().unwrap(), Minimizer::Lsmr);
        assert_eq!("cgls".parse::<Minimizer>().unwrap(), Minimizer::Cgls);
        assert!("lbfgs".parse::<Minimizer>().is_err());
        assert_eq!(Minimizer::default().to_string(), "lsmr");
    }

    #[test]
    fn both_minimizers_agree_on_consistent_system() {
        let op = testing::tall_system();
        let truth = Array1::from(vec![1.0, -2.0, 0.5, 3.0, -1.0]);
        let b = op.apply(truth.view()).unwrap();
        for minimizer in [Minimizer::Lsmr, Minimizer::Cgls] {
            let outcome = minimizer.solve(&op, b.view(), 50).unwrap();
            let err = norm(&(&outcome.x - &truth));
            assert!(err < 1e-5, "{minimizer}: error {err}");
        }
    }
}
