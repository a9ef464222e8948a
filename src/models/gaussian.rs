//! Multivariate Gaussian emission density
//!
//! Full or diagonal covariance. The covariance is inverted once at
//! construction; the inverse and the log-normalization constant are cached
//! and re-derived whenever the parameters change.

use ndarray::{Array1, Array2, ArrayView1};
use std::f64::consts::PI;
use tracing::warn;

use crate::error::{HmmError, Result};
use crate::math::linalg::{invert, log_determinant, sanitize};
use crate::math::logprob::{sanitize_ln, LOG_ZERO};

/// Covariance parameterization of a Gaussian.
#[derive(Debug, Clone)]
pub enum Covariance {
    /// Full D×D covariance matrix.
    Full(Array2<f64>),
    /// Diagonal covariance stored as a variance vector.
    Diagonal(Array1<f64>),
}

impl Covariance {
    /// Dimensionality of the covariance.
    pub fn dim(&self) -> usize {
        match self {
            Covariance::Full(m) => m.nrows(),
            Covariance::Diagonal(v) => v.len(),
        }
    }
}

/// A single multivariate Gaussian with cached inverse covariance and
/// log-normalization constant.
#[derive(Debug, Clone)]
pub struct GaussianModel {
    mean: Array1<f64>,
    covariance: Covariance,
    /// Inverted covariance, sanitized so no NaN/∞ entry survives.
    inv_covariance: Covariance,
    /// ½·(D·ln2π + log|Σ|)
    log_norm: f64,
}

impl GaussianModel {
    /// Build a Gaussian, inverting and sanitizing the covariance up front.
    pub fn new(mean: Array1<f64>, covariance: Covariance) -> Result<Self> {
        if covariance.dim() != mean.len() {
            return Err(HmmError::DimensionMismatch(format!(
                "mean has dim {} but covariance has dim {}",
                mean.len(),
                covariance.dim()
            )));
        }
        let mut model = Self {
            mean,
            covariance,
            inv_covariance: Covariance::Diagonal(Array1::zeros(0)),
            log_norm: 0.0,
        };
        model.refresh_cache();
        Ok(model)
    }

    /// Gaussian with unit diagonal covariance.
    pub fn with_identity(mean: Array1<f64>) -> Self {
        let d = mean.len();
        Self::new(mean, Covariance::Diagonal(Array1::ones(d)))
            .expect("identity covariance always matches the mean dimension")
    }

    /// Dimensionality.
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Mean vector.
    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Covariance parameters.
    pub fn covariance(&self) -> &Covariance {
        &self.covariance
    }

    /// Replace the parameters, re-inverting and re-sanitizing.
    pub fn set_parameters(&mut self, mean: Array1<f64>, covariance: Covariance) -> Result<()> {
        if covariance.dim() != mean.len() {
            return Err(HmmError::DimensionMismatch(format!(
                "mean has dim {} but covariance has dim {}",
                mean.len(),
                covariance.dim()
            )));
        }
        self.mean = mean;
        self.covariance = covariance;
        self.refresh_cache();
        Ok(())
    }

    /// Re-derive the cached inverse and log-normalization constant.
    ///
    /// Near-singular covariances from low-occupation states can invert to
    /// non-numbers; those entries are clipped rather than propagated, and a
    /// vanished determinant falls back to the log-domain zero sentinel.
    fn refresh_cache(&mut self) {
        let d = self.dim() as f64;
        let log_det;
        match &self.covariance {
            Covariance::Full(cov) => {
                let inv = match invert(cov) {
                    Ok(m) => m,
                    Err(_) => {
                        warn!("covariance inversion failed, clipping to sentinel");
                        Array2::from_elem(cov.dim(), f64::INFINITY)
                    }
                };
                self.inv_covariance = Covariance::Full(sanitize(&inv));
                log_det = log_determinant(cov);
            }
            Covariance::Diagonal(vars) => {
                let inv_diag = Array2::from_diag(
                    &vars.mapv(|v| if v > 0.0 { 1.0 / v } else { f64::INFINITY }),
                );
                self.inv_covariance = Covariance::Diagonal(sanitize(&inv_diag).diag().to_owned());

                let mut sum = 0.0;
                for &v in vars.iter() {
                    sum += if v > 0.0 { v.ln() } else { f64::NEG_INFINITY };
                }
                log_det = if sum.is_finite() {
                    sum
                } else {
                    warn!("diagonal determinant underflow, treating as log-zero");
                    LOG_ZERO
                };
            }
        }
        self.log_norm = 0.5 * (d * (2.0 * PI).ln() + log_det);
    }

    /// Log-density of `x` under this Gaussian.
    ///
    /// The result is always finite: NaN inputs or outputs map to the
    /// log-domain zero sentinel and +∞ clamps to the largest finite value,
    /// so downstream Viterbi and forward sums never see a non-number.
    pub fn log_density(&self, x: ArrayView1<'_, f64>) -> f64 {
        if x.len() != self.dim() || x.iter().any(|v| v.is_nan()) {
            return LOG_ZERO;
        }

        let quad = match &self.inv_covariance {
            Covariance::Full(inv) => {
                let mut quad = 0.0;
                for i in 0..self.dim() {
                    let di = x[i] - self.mean[i];
                    for j in 0..self.dim() {
                        let dj = x[j] - self.mean[j];
                        quad += di * inv[[i, j]] * dj;
                    }
                }
                quad
            }
            Covariance::Diagonal(inv) => {
                let mut quad = 0.0;
                for i in 0..self.dim() {
                    let d = x[i] - self.mean[i];
                    quad += d * d * inv[i];
                }
                quad
            }
        };

        sanitize_ln(-0.5 * quad - self.log_norm)
    }
}
