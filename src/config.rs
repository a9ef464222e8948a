//! Training configuration
//!
//! All numeric knobs consumed by the reestimation engine live here so a
//! training run is reproducible from one value set.

/// Configuration for Baum-Welch training and decoding.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Pruning beam width as a log-probability distance from the best
    /// state at each frame. States further away are treated as zero.
    pub beam: f64,
    /// Elementwise floor applied to reestimated variances.
    pub covariance_floor: f64,
    /// Absolute minimum a floored variance must still reach; a matrix
    /// violating it is rejected and the previous parameters retained.
    pub min_covariance: f64,
    /// Stop when |Δ average per-frame log-likelihood| drops below this.
    pub convergence_threshold: f64,
    /// Maximum number of EM iterations.
    pub max_iterations: usize,
    /// Mixture components below this weight are pruned after reestimation.
    pub mixture_prune_threshold: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            beam: 200.0,
            covariance_floor: 1e-5,
            min_covariance: 1e-8,
            convergence_threshold: 1e-4,
            max_iterations: 20,
            mixture_prune_threshold: 1e-6,
        }
    }
}

impl TrainingConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pruning beam width.
    pub fn with_beam(mut self, beam: f64) -> Self {
        self.beam = beam;
        self
    }

    /// Set the variance floor.
    pub fn with_covariance_floor(mut self, floor: f64) -> Self {
        self.covariance_floor = floor;
        self
    }

    /// Set the convergence threshold on the average log-likelihood delta.
    pub fn with_convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = threshold;
        self
    }

    /// Set the maximum number of EM iterations.
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }
}
