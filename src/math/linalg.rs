//! Dense matrix algebra for covariance handling
//!
//! Gaussian elimination with partial pivoting covers every solve and
//! inversion the trainer needs; covariance matrices here are small (feature
//! dimension squared), so no factorization caching is done.

use ndarray::{Array1, Array2};
use tracing::warn;

use crate::error::{HmmError, Result};
use crate::math::logprob::LOG_ZERO;

/// Clip value for non-finite matrix entries.
const CLIP: f64 = 1.0e10;

/// Pivot magnitude below which a matrix is treated as singular.
const SINGULAR_EPS: f64 = 1e-15;

/// Replace NaN and infinite entries with a large finite sentinel.
///
/// Near-singular covariances in low-occupation states can invert to
/// non-numbers; the contract is that no NaN or infinity survives past model
/// construction or reestimation.
pub fn sanitize(m: &Array2<f64>) -> Array2<f64> {
    m.mapv(|v| {
        if v.is_nan() {
            CLIP
        } else if v == f64::INFINITY {
            CLIP
        } else if v == f64::NEG_INFINITY {
            -CLIP
        } else {
            v
        }
    })
}

/// Invert a square matrix via Gauss-Jordan elimination with partial pivoting.
pub fn invert(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(HmmError::DimensionMismatch(format!(
            "cannot invert {}x{} matrix",
            a.nrows(),
            a.ncols()
        )));
    }

    // Augment with the identity
    let mut aug = Array2::zeros((n, 2 * n));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = a[[i, j]];
        }
        aug[[i, n + i]] = 1.0;
    }

    for col in 0..n {
        // Partial pivoting
        let mut max_row = col;
        let mut max_val = aug[[col, col]].abs();
        for row in (col + 1)..n {
            let val = aug[[row, col]].abs();
            if val > max_val {
                max_val = val;
                max_row = row;
            }
        }
        if max_val < SINGULAR_EPS {
            return Err(HmmError::SingularMatrix(format!(
                "pivot {max_val:.3e} at column {col}"
            )));
        }
        if max_row != col {
            for j in 0..2 * n {
                let tmp = aug[[col, j]];
                aug[[col, j]] = aug[[max_row, j]];
                aug[[max_row, j]] = tmp;
            }
        }

        // Scale pivot row
        let pivot = aug[[col, col]];
        for j in 0..2 * n {
            aug[[col, j]] /= pivot;
        }

        // Eliminate all other rows
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = aug[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for j in 0..2 * n {
                let above = aug[[col, j]];
                aug[[row, j]] -= factor * above;
            }
        }
    }

    let mut inv = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            inv[[i, j]] = aug[[i, n + j]];
        }
    }
    Ok(inv)
}

/// Solve `A x = b` via Gaussian elimination with partial pivoting.
pub fn solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.len() != n {
        return Err(HmmError::DimensionMismatch(format!(
            "solve: {}x{} matrix with rhs of length {}",
            a.nrows(),
            a.ncols(),
            b.len()
        )));
    }

    let mut aug = Array2::zeros((n, n + 1));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = a[[i, j]];
        }
        aug[[i, n]] = b[i];
    }

    for col in 0..n {
        let mut max_row = col;
        let mut max_val = aug[[col, col]].abs();
        for row in (col + 1)..n {
            let val = aug[[row, col]].abs();
            if val > max_val {
                max_val = val;
                max_row = row;
            }
        }
        if max_val < SINGULAR_EPS {
            return Err(HmmError::SingularMatrix(format!(
                "pivot {max_val:.3e} at column {col}"
            )));
        }
        if max_row != col {
            for j in 0..=n {
                let tmp = aug[[col, j]];
                aug[[col, j]] = aug[[max_row, j]];
                aug[[max_row, j]] = tmp;
            }
        }

        let pivot = aug[[col, col]];
        for row in (col + 1)..n {
            let factor = aug[[row, col]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in col..=n {
                let above = aug[[col, j]];
                aug[[row, j]] -= factor * above;
            }
        }
    }

    // Back-substitute
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut sum = aug[[i, n]];
        for j in (i + 1)..n {
            sum -= aug[[i, j]] * x[j];
        }
        x[i] = sum / aug[[i, i]];
    }
    Ok(x)
}

/// Log-determinant of a square matrix via LU decomposition.
///
/// A determinant that underflows to zero, goes negative, or produces a
/// non-finite log is reported as log-domain zero with a warning; callers
/// continue with the sentinel rather than aborting.
pub fn log_determinant(a: &Array2<f64>) -> f64 {
    let n = a.nrows();
    if a.ncols() != n {
        warn!("log_determinant on non-square {}x{} matrix", a.nrows(), a.ncols());
        return LOG_ZERO;
    }
    if n == 0 {
        return 0.0;
    }

    let mut lu = a.clone();
    let mut sign = 1.0;

    for col in 0..n {
        let mut max_row = col;
        let mut max_val = lu[[col, col]].abs();
        for row in (col + 1)..n {
            let val = lu[[row, col]].abs();
            if val > max_val {
                max_val = val;
                max_row = row;
            }
        }
        if max_val < SINGULAR_EPS {
            warn!("determinant underflow: pivot {max_val:.3e} at column {col}");
            return LOG_ZERO;
        }
        if max_row != col {
            for j in 0..n {
                let tmp = lu[[col, j]];
                lu[[col, j]] = lu[[max_row, j]];
                lu[[max_row, j]] = tmp;
            }
            sign = -sign;
        }

        let pivot = lu[[col, col]];
        for row in (col + 1)..n {
            let factor = lu[[row, col]] / pivot;
            for j in col..n {
                let above = lu[[col, j]];
                lu[[row, j]] -= factor * above;
            }
        }
    }

    let mut log_det = 0.0;
    for i in 0..n {
        let d = lu[[i, i]];
        if d < 0.0 {
            sign = -sign;
        }
        log_det += d.abs().ln();
    }

    if sign < 0.0 || !log_det.is_finite() {
        warn!("non-positive or non-finite determinant (log {log_det:.3e})");
        return LOG_ZERO;
    }
    log_det
}
