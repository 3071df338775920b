//! LSMR solver
//!
//! Least Squares Minimal Residual algorithm for `min ||A x - b||₂`.
//! Both `||r_k||` and `||Aᵀ r_k||` decrease monotonically.
//!
//! Reference:
//! Fong & Saunders, "LSMR: An iterative algorithm for sparse
//! least-squares problems", SISC 2011.

use ndarray::{Array1, ArrayView1};
use tracing::trace;

use super::{norm, SolverOutcome, StopReason};
use crate::error::{ReconError, Result};
use crate::operator::LinearOperator;

/// Stopping tolerances, with the usual LSMR defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LsmrOptions {
    pub atol: f64,
    pub btol: f64,
    pub conlim: f64,
    pub max_iter: usize,
}

impl Default for LsmrOptions {
    fn default() -> Self {
        Self {
            atol: 1e-6,
            btol: 1e-6,
            conlim: 1e8,
            max_iter: 100,
        }
    }
}

impl LsmrOptions {
    pub fn with_max_iter(max_iter: usize) -> Self {
        Self {
            max_iter,
            ..Self::default()
        }
    }
}

/// Stable Givens rotation: returns `(c, s, r)` with `[c s; -s c]ᵀ (a, b) = (r, 0)`.
fn sym_ortho(a: f64, b: f64) -> (f64, f64, f64) {
    let sign = |v: f64| {
        if v > 0.0 {
            1.0
        } else if v < 0.0 {
            -1.0
        } else {
            0.0
        }
    };
    if b == 0.0 {
        (sign(a), 0.0, a.abs())
    } else if a == 0.0 {
        (0.0, sign(b), b.abs())
    } else if b.abs() > a.abs() {
        let tau = a / b;
        let s = sign(b) / (1.0 + tau * tau).sqrt();
        let c = s * tau;
        (c, s, b / s)
    } else {
        let tau = b / a;
        let c = sign(a) / (1.0 + tau * tau).sqrt();
        let s = c * tau;
        (c, s, a / c)
    }
}

/// LSMR solver
///
/// Solves `min ||A x - b||₂` starting from `x = 0`.
///
/// # Arguments
/// * `op` - Operator providing `A x` and `Aᵀ y`
/// * `b` - Right-hand side vector
/// * `options` - Tolerances and iteration cap
pub fn lsmr_solve(
    op: &dyn LinearOperator,
    b: ArrayView1<f64>,
    options: &LsmrOptions,
) -> Result<SolverOutcome> {
    if b.len() != op.rows() {
        return Err(ReconError::shape(&[op.rows()], &[b.len()]));
    }
    let n = op.cols();

    let mut u = b.to_owned();
    let norm_b = norm(&u);
    let mut beta = norm_b;
    let mut x = Array1::<f64>::zeros(n);

    let mut v = if beta > 0.0 {
        u /= beta;
        op.apply_adjoint(u.view())?
    } else {
        Array1::zeros(n)
    };
    let mut alpha = norm(&v);
    if alpha > 0.0 {
        v /= alpha;
    }

    if alpha * beta == 0.0 {
        return Ok(SolverOutcome {
            x,
            iterations: 0,
            stop_reason: StopReason::ZeroSolution,
            residual_norm: norm_b,
        });
    }

    // Bidiagonalization and QR state
    let mut zeta_bar = alpha * beta;
    let mut alpha_bar = alpha;
    let mut rho = 1.0;
    let mut rho_bar = 1.0;
    let mut c_bar = 1.0;
    let mut s_bar = 0.0;
    let mut zeta = 0.0;

    let mut h = v.clone();
    let mut h_bar = Array1::<f64>::zeros(n);

    // Residual norm estimation
    let mut beta_dd = beta;
    let mut beta_d = 0.0;
    let mut rho_d_old = 1.0;
    let mut tau_tilde_old = 0.0;
    let mut theta_tilde = 0.0;
    let mut d = 0.0;

    // ||A|| and cond(A) estimation
    let mut norm_a2 = alpha * alpha;
    let mut max_rho_bar: f64 = 0.0;
    let mut min_rho_bar: f64 = 1e100;
    let ctol = if options.conlim > 0.0 {
        1.0 / options.conlim
    } else {
        0.0
    };

    let mut norm_r = beta;
    let mut stop_reason = StopReason::IterationLimit;
    let mut iterations = 0;

    while iterations < options.max_iter {
        iterations += 1;

        // Golub-Kahan step
        u *= -alpha;
        u += &op.apply(v.view())?;
        beta = norm(&u);
        if beta > 0.0 {
            u /= beta;
            v *= -beta;
            v += &op.apply_adjoint(u.view())?;
            alpha = norm(&v);
            if alpha > 0.0 {
                v /= alpha;
            }
        }

        // Rotation P_k (no damping, so the first rotation is trivial)
        let (c_hat, s_hat, alpha_hat) = sym_ortho(alpha_bar, 0.0);
        let rho_old = rho;
        let (c, s, rho_new) = sym_ortho(alpha_hat, beta);
        rho = rho_new;
        let theta_new = s * alpha;
        alpha_bar = c * alpha;

        // Rotation Pbar_k
        let rho_bar_old = rho_bar;
        let zeta_old = zeta;
        let theta_bar = s_bar * rho;
        let rho_temp = c_bar * rho;
        let (cb, sb, rb) = sym_ortho(c_bar * rho, theta_new);
        c_bar = cb;
        s_bar = sb;
        rho_bar = rb;
        zeta = c_bar * zeta_bar;
        zeta_bar = -s_bar * zeta_bar;

        if rho == 0.0 || rho_bar == 0.0 {
            stop_reason = StopReason::LeastSquaresTolerance;
            break;
        }

        // Update h, h_bar, x
        h_bar *= -(theta_bar * rho / (rho_old * rho_bar_old));
        h_bar += &h;
        x.scaled_add(zeta / (rho * rho_bar), &h_bar);
        h *= -(theta_new / rho);
        h += &v;

        // Estimate ||r||
        let beta_acute = c_hat * beta_dd;
        let beta_check = -s_hat * beta_dd;
        let beta_hat = c * beta_acute;
        beta_dd = -s * beta_acute;

        let theta_tilde_old = theta_tilde;
        let (c_tilde_old, s_tilde_old, rho_tilde_old) = sym_ortho(rho_d_old, theta_bar);
        theta_tilde = s_tilde_old * rho_bar;
        rho_d_old = c_tilde_old * rho_bar;
        beta_d = -s_tilde_old * beta_d + c_tilde_old * beta_hat;

        tau_tilde_old = (zeta_old - theta_tilde_old * tau_tilde_old) / rho_tilde_old;
        let tau_d = (zeta - theta_tilde * tau_tilde_old) / rho_d_old;
        d += beta_check * beta_check;
        norm_r = (d + (beta_d - tau_d).powi(2) + beta_dd * beta_dd).sqrt();

        // Estimate ||A|| and cond(A)
        norm_a2 += beta * beta;
        let norm_a = norm_a2.sqrt();
        norm_a2 += alpha * alpha;
        max_rho_bar = max_rho_bar.max(rho_bar_old);
        if iterations > 1 {
            min_rho_bar = min_rho_bar.min(rho_bar_old);
        }
        let cond_a = max_rho_bar.max(rho_temp) / min_rho_bar.min(rho_temp);

        // Convergence tests
        let norm_ar = zeta_bar.abs();
        let norm_x = norm(&x);
        let test1 = norm_r / norm_b;
        let test2 = if norm_a * norm_r != 0.0 {
            norm_ar / (norm_a * norm_r)
        } else {
            f64::INFINITY
        };
        let test3 = 1.0 / cond_a;
        let t1 = test1 / (1.0 + norm_a * norm_x / norm_b);
        let rtol = options.btol + options.atol * norm_a * norm_x / norm_b;

        trace!(iteration = iterations, norm_r, norm_ar, "lsmr");

        let reason = if test1 <= rtol {
            Some(StopReason::ResidualTolerance)
        } else if test2 <= options.atol {
            Some(StopReason::LeastSquaresTolerance)
        } else if test3 <= ctol {
            Some(StopReason::ConditionLimit)
        } else if 1.0 + t1 <= 1.0 || 1.0 + test2 <= 1.0 || 1.0 + test3 <= 1.0 {
            Some(StopReason::MachinePrecision)
        } else {
            None
        };
        if let Some(reason) = reason {
            stop_reason = reason;
            break;
        }
    }

    Ok(SolverOutcome {
        x,
        iterations,
        stop_reason,
        residual_norm: norm_r,
    })
}
