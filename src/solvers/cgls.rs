//! CGLS solver
//!
//! Conjugate gradients applied to the normal equations `Aᵀ A x = Aᵀ b`
//! without forming `Aᵀ A`.

use ndarray::{Array1, ArrayView1};
use tracing::trace;

use super::{norm, SolverOutcome, StopReason};
use crate::error::{ReconError, Result};
use crate::operator::LinearOperator;

/// CGLS solver
///
/// # Arguments
/// * `op` - Operator providing `A x` and `Aᵀ y`
/// * `b` - Right-hand side vector
/// * `tol` - Relative tolerance on `||Aᵀ r||`
/// * `max_iter` - Maximum iterations
pub fn cgls_solve(
    op: &dyn LinearOperator,
    b: ArrayView1<f64>,
    tol: f64,
    max_iter: usize,
) -> Result<SolverOutcome> {
    if b.len() != op.rows() {
        return Err(ReconError::shape(&[op.rows()], &[b.len()]));
    }

    let mut x = Array1::<f64>::zeros(op.cols());
    let mut r = b.to_owned();
    let mut s = op.apply_adjoint(r.view())?;
    let mut p = s.clone();

    let mut gamma = s.dot(&s);
    let gamma0 = gamma;
    if gamma0 == 0.0 {
        return Ok(SolverOutcome {
            x,
            iterations: 0,
            stop_reason: StopReason::ZeroSolution,
            residual_norm: norm(&r),
        });
    }

    let mut stop_reason = StopReason::IterationLimit;
    let mut iterations = 0;
    while iterations < max_iter {
        iterations += 1;

        let q = op.apply(p.view())?;
        let delta = q.dot(&q);
        if delta == 0.0 {
            stop_reason = StopReason::LeastSquaresTolerance;
            break;
        }
        let step = gamma / delta;

        // x = x + step * p, r = r - step * q
        x.scaled_add(step, &p);
        r.scaled_add(-step, &q);

        s = op.apply_adjoint(r.view())?;
        let gamma_new = s.dot(&s);
        trace!(iteration = iterations, norm_ar = gamma_new.sqrt(), "cgls");

        if gamma_new.sqrt() <= tol * gamma0.sqrt() {
            stop_reason = StopReason::LeastSquaresTolerance;
            break;
        }

        let beta = gamma_new / gamma;
        p *= beta;
        p += &s;
        gamma = gamma_new;
    }

    Ok(SolverOutcome {
        residual_norm: norm(&r),
        x,
        iterations,
        stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::testing::tall_system;

    #[test]
    fn converges_to_least_squares_solution() {
        let op = tall_system();
        let b = Array1::from_shape_fn(op.rows(), |i| 1.0 + i as f64 * 0.1);
        let outcome = cgls_solve(&op, b.view(), 1e-12, 100).unwrap();
        let r = &b - &op.apply(outcome.x.view()).unwrap();
        let grad = op.apply_adjoint(r.view()).unwrap();
        assert!(norm(&grad) < 1e-8);
        assert!(outcome.iterations <= 10);
    }

    #[test]
    fn zero_rhs_returns_immediately() {
        let op = tall_system();
        let b = Array1::zeros(op.rows());
        let outcome = cgls_solve(&op, b.view(), 1e-6, 10).unwrap();
        assert_eq!(outcome.stop_reason, StopReason::ZeroSolution);
    }
}
