//! Joint linear-Gaussian factor extension
//!
//! Couples each (model, state) pair to a second, lower-dimensional
//! synthesis parameter space through an EM-estimated linear-Gaussian
//! channel y ≈ A·x + b with residual covariance Σw. Estimation is two
//! sequential passes over time-aligned acoustic/synthesis pairs; inference
//! is a closed-form Gaussian-conditioning MAP reconstruction of the
//! synthesis vector from the acoustic observation and a decoded state.

use std::fmt;

use ndarray::{Array1, Array2};
use tracing::{info, warn};

use crate::config::TrainingConfig;
use crate::data::{FeatureSequence, PairedUtterance};
use crate::error::{HmmError, Result};
use crate::models::HmmSet;
use crate::train::accumulators::{
    BiasAccumulator, CrossCovarianceAccumulator, FullCovarianceAccumulator, MeanAccumulator,
};
use crate::train::forward_backward::ForwardBackwardEngine;

/// Occupation below which a posterior contributes nothing worth streaming.
const MIN_POSTERIOR: f64 = 1e-10;

/// Estimated factor parameters for one (model, state) cell.
#[derive(Debug, Clone)]
pub struct FactorCell {
    /// Synthesis-space mean μx.
    pub synthesis_mean: Array1<f64>,
    /// Synthesis-space covariance Σx.
    pub synthesis_covariance: Array2<f64>,
    /// Factor-loading matrix A, acoustic-dim × synthesis-dim.
    pub loading: Array2<f64>,
    /// Bias b, acoustic-dim.
    pub bias: Array1<f64>,
    /// Residual covariance Σw, acoustic-dim × acoustic-dim.
    pub residual_covariance: Array2<f64>,
}

/// Factor cells indexed by (physical model, 1-based emitting state).
#[derive(Debug, Clone)]
pub struct FactorTable {
    cells: Vec<Vec<Option<FactorCell>>>,
    synthesis_dim: usize,
}

impl FactorTable {
    /// The cell for `model` and 1-based emitting state `state`, if that
    /// cell collected enough occupation to be estimated.
    pub fn cell(&self, model: usize, state: usize) -> Option<&FactorCell> {
        self.cells.get(model)?.get(state - 1)?.as_ref()
    }

    /// Synthesis-space dimensionality.
    pub fn synthesis_dim(&self) -> usize {
        self.synthesis_dim
    }

    /// Number of estimated cells.
    pub fn num_estimated(&self) -> usize {
        self.cells
            .iter()
            .flat_map(|states| states.iter())
            .filter(|c| c.is_some())
            .count()
    }
}

/// Diagnostics from the two estimation passes.
#[derive(Debug, Clone, Default)]
pub struct FactorReport {
    pub total_utterances: usize,
    pub skipped_utterances: usize,
    pub estimated_cells: usize,
    /// Cells dropped for zero occupation or a failed solve,
    /// as (physical model, state) pairs.
    pub dropped_cells: Vec<(usize, usize)>,
}

impl fmt::Display for FactorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "factor estimation: {} cell(s) estimated, {} dropped; \
             {} of {} utterances skipped",
            self.estimated_cells,
            self.dropped_cells.len(),
            self.skipped_utterances,
            self.total_utterances,
        )
    }
}

/// Per-cell accumulators for pass 1.
struct CellStats {
    mean: MeanAccumulator,
    covariance: FullCovarianceAccumulator,
    cross: CrossCovarianceAccumulator,
    bias: BiasAccumulator,
}

/// Two-pass EM estimator for the joint factor model.
pub struct LinearFactorReestimator {
    config: TrainingConfig,
}

impl LinearFactorReestimator {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    /// Estimate factor cells for every (model, state) with occupation.
    ///
    /// Pass 1 accumulates synthesis-space moments and acoustic/synthesis
    /// cross statistics under the same occupation posteriors as embedded
    /// reestimation, then solves for μx, Σx, A and b. Pass 2 recomputes
    /// the per-frame residual e = y − (A·x + b) under the pass-1
    /// parameters and reestimates Σw from it.
    pub fn estimate(
        &self,
        set: &HmmSet,
        corpus: &[PairedUtterance],
    ) -> Result<(FactorTable, FactorReport)> {
        let synthesis_dim = corpus
            .first()
            .map(|u| u.synthesis.dim())
            .ok_or_else(|| HmmError::DimensionMismatch("empty paired corpus".into()))?;
        let acoustic_dim = set.dim();
        for u in corpus {
            if u.synthesis.dim() != synthesis_dim {
                return Err(HmmError::DimensionMismatch(format!(
                    "synthesis dim {} does not match {synthesis_dim}",
                    u.synthesis.dim()
                )));
            }
        }

        let mut report = FactorReport {
            total_utterances: corpus.len(),
            ..FactorReport::default()
        };
        let engine = ForwardBackwardEngine::new(set, &self.config);

        // Pass 1: moments and cross statistics
        let mut stats: Vec<Vec<CellStats>> = (0..set.num_physical())
            .map(|p| {
                (0..set.physical_model(p).num_states())
                    .map(|_| CellStats {
                        mean: MeanAccumulator::new(synthesis_dim),
                        covariance: FullCovarianceAccumulator::new(synthesis_dim),
                        cross: CrossCovarianceAccumulator::new(acoustic_dim, synthesis_dim),
                        bias: BiasAccumulator::new(acoustic_dim, synthesis_dim),
                    })
                    .collect()
            })
            .collect();

        for (index, utterance) in corpus.iter().enumerate() {
            let lattice = match engine.analyze(&utterance.acoustic, &utterance.transcription) {
                Ok(lattice) => lattice,
                Err(e) if e.is_recoverable() => {
                    warn!("paired utterance {index} skipped in pass 1: {e}");
                    report.skipped_utterances += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            for t in 0..lattice.num_frames() {
                let y = utterance.acoustic.frame(t);
                let x = utterance.synthesis.frame(t);
                for g in 0..lattice.chain().num_states() {
                    let gamma = lattice.gamma(t, g);
                    if gamma < MIN_POSTERIOR {
                        continue;
                    }
                    let cs = lattice.chain().state(g);
                    let cell = &mut stats[cs.physical][cs.local - 1];
                    cell.mean.update(gamma, x);
                    cell.covariance.update(gamma, x);
                    cell.cross.update(gamma, y, x);
                    cell.bias.update(gamma, y, x);
                }
            }
        }

        // Solve pass-1 parameters per cell
        let mut partial: Vec<Vec<Option<(Array1<f64>, Array2<f64>, Array2<f64>, Array1<f64>)>>> =
            Vec::with_capacity(set.num_physical());
        for (p, states) in stats.iter().enumerate() {
            let mut row = Vec::with_capacity(states.len());
            for (s, cell) in states.iter().enumerate() {
                let state = s + 1;
                if cell.mean.occupation() <= 0.0 {
                    report.dropped_cells.push((p, state));
                    row.push(None);
                    continue;
                }

                let mut mean = Array1::zeros(synthesis_dim);
                let mut covariance = Array2::zeros((synthesis_dim, synthesis_dim));
                let mut loading = Array2::zeros((acoustic_dim, synthesis_dim));
                let mut bias = Array1::zeros(acoustic_dim);

                let ok = cell.mean.reestimate(&mut mean)
                    && cell.covariance.reestimate(
                        &mut covariance,
                        self.config.covariance_floor,
                        self.config.min_covariance,
                    )
                    && cell.cross.reestimate_loading(&mut loading)
                    && cell.bias.reestimate(&mut bias, &loading);

                if ok {
                    row.push(Some((mean, covariance, loading, bias)));
                } else {
                    warn!("factor cell (model {p}, state {state}) dropped in pass 1");
                    report.dropped_cells.push((p, state));
                    row.push(None);
                }
            }
            partial.push(row);
        }

        // Pass 2: residual covariance under the pass-1 parameters
        let mut residuals: Vec<Vec<FullCovarianceAccumulator>> = (0..set.num_physical())
            .map(|p| {
                (0..set.physical_model(p).num_states())
                    .map(|_| FullCovarianceAccumulator::new(acoustic_dim))
                    .collect()
            })
            .collect();

        for (index, utterance) in corpus.iter().enumerate() {
            let lattice = match engine.analyze(&utterance.acoustic, &utterance.transcription) {
                Ok(lattice) => lattice,
                Err(e) if e.is_recoverable() => {
                    warn!("paired utterance {index} skipped in pass 2: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            for t in 0..lattice.num_frames() {
                let y = utterance.acoustic.frame(t);
                let x = utterance.synthesis.frame(t);
                for g in 0..lattice.chain().num_states() {
                    let gamma = lattice.gamma(t, g);
                    if gamma < MIN_POSTERIOR {
                        continue;
                    }
                    let cs = lattice.chain().state(g);
                    let Some((_, _, loading, bias)) = &partial[cs.physical][cs.local - 1]
                    else {
                        continue;
                    };
                    let predicted = loading.dot(&x) + bias;
                    let residual = &y.to_owned() - &predicted;
                    residuals[cs.physical][cs.local - 1].update(gamma, residual.view());
                }
            }
        }

        // Assemble the table
        let mut cells = Vec::with_capacity(set.num_physical());
        for (p, row) in partial.into_iter().enumerate() {
            let mut out = Vec::with_capacity(row.len());
            for (s, entry) in row.into_iter().enumerate() {
                let state = s + 1;
                match entry {
                    Some((synthesis_mean, synthesis_covariance, loading, bias)) => {
                        let mut residual_covariance = Array2::zeros((acoustic_dim, acoustic_dim));
                        if residuals[p][s].reestimate(
                            &mut residual_covariance,
                            self.config.covariance_floor,
                            self.config.min_covariance,
                        ) {
                            report.estimated_cells += 1;
                            out.push(Some(FactorCell {
                                synthesis_mean,
                                synthesis_covariance,
                                loading,
                                bias,
                                residual_covariance,
                            }));
                        } else {
                            warn!("factor cell (model {p}, state {state}) dropped in pass 2");
                            report.dropped_cells.push((p, state));
                            out.push(None);
                        }
                    }
                    None => out.push(None),
                }
            }
            cells.push(out);
        }

        info!("{report}");
        Ok((
            FactorTable {
                cells,
                synthesis_dim,
            },
            report,
        ))
    }
}

/// Closed-form MAP reconstruction of synthesis parameters from acoustic
/// observations along a decoded state path.
///
/// For each frame, using the cell of the decoded state (1-based emitting
/// numbering, offset past the non-emitting entry state):
///
/// x̂ = (Σx⁻¹ + Aᵀ·Σw⁻¹·A)⁻¹ · (Σx⁻¹·μx + Aᵀ·Σw⁻¹·(y − b))
///
/// This inverts two matrices per frame and is the numerically heaviest
/// inference operation in the crate.
pub fn reconstruct_synthesis(
    table: &FactorTable,
    model: usize,
    path: &[usize],
    acoustics: &FeatureSequence,
) -> Result<FeatureSequence> {
    if path.len() != acoustics.len() {
        return Err(HmmError::LengthMismatch {
            acoustic: acoustics.len(),
            synthesis: path.len(),
        });
    }

    let dx = table.synthesis_dim();
    let mut out = Array2::zeros((path.len(), dx));

    for (t, &state) in path.iter().enumerate() {
        let cell = table
            .cell(model, state)
            .ok_or(HmmError::MissingFactorCell { model, state })?;

        let y = acoustics.frame(t);
        let prior_precision = crate::math::linalg::invert(&cell.synthesis_covariance)?;
        let residual_precision = crate::math::linalg::invert(&cell.residual_covariance)?;

        // Aᵀ·Σw⁻¹
        let at_rw = cell.loading.t().dot(&residual_precision);
        // Posterior precision Σx⁻¹ + Aᵀ·Σw⁻¹·A
        let posterior_precision = &prior_precision + &at_rw.dot(&cell.loading);
        let innovation = &y.to_owned() - &cell.bias;
        let rhs = prior_precision.dot(&cell.synthesis_mean) + at_rw.dot(&innovation);

        let x_hat = crate::math::linalg::solve(&posterior_precision, &rhs)?;
        out.row_mut(t).assign(&x_hat);
    }

    FeatureSequence::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Covariance, GaussianModel, HmmModel, MixtureModel};
    use ndarray::{arr2, array};

    fn gaussian_state(mean: f64) -> MixtureModel {
        MixtureModel::single(GaussianModel::with_identity(array![mean, mean]))
    }

    fn paired_set() -> HmmSet {
        let model = HmmModel::left_right_no_skip(
            "m",
            0.5,
            vec![gaussian_state(0.0), gaussian_state(5.0)],
        )
        .unwrap();
        HmmSet::new(vec![model]).unwrap()
    }

    /// Paired corpus where y = A·x + b exactly, with per-state x clusters.
    fn paired_corpus() -> Vec<PairedUtterance> {
        let a = array![[2.0, 0.0], [0.0, -1.0]];
        let b = array![0.0, 5.0];

        let mut utterances = Vec::new();
        for shift in [0.0, 0.05, -0.05, 0.1] {
            // State 1 synthesizes around (0, 5), state 2 around (2.5, -0.2);
            // the two point families per state lie on different lines so the
            // per-state synthesis covariance stays non-singular.
            let xs = [
                array![0.0 + shift, 5.0 - 2.0 * shift],
                array![0.2 - shift, 4.8 + shift],
                array![2.5 + shift, -0.2 - 2.0 * shift],
                array![2.3 - shift, -0.1 + shift],
            ];
            let mut acoustic = Array2::zeros((4, 2));
            let mut synthesis = Array2::zeros((4, 2));
            for (t, x) in xs.iter().enumerate() {
                let y = a.dot(x) + &b;
                acoustic.row_mut(t).assign(&y);
                synthesis.row_mut(t).assign(x);
            }
            utterances.push(
                PairedUtterance::new(
                    FeatureSequence::new(acoustic).unwrap(),
                    FeatureSequence::new(synthesis).unwrap(),
                    vec![0],
                )
                .unwrap(),
            );
        }
        utterances
    }

    #[test]
    fn test_estimate_recovers_linear_channel() {
        let set = paired_set();
        let corpus = paired_corpus();
        let estimator = LinearFactorReestimator::new(TrainingConfig::default());

        let (table, report) = estimator.estimate(&set, &corpus).unwrap();
        assert!(report.estimated_cells > 0);

        // Every estimated loading matrix should be close to the true A.
        let a_true = array![[2.0, 0.0], [0.0, -1.0]];
        for state in 1..=2 {
            if let Some(cell) = table.cell(0, state) {
                for i in 0..2 {
                    for j in 0..2 {
                        assert!(
                            (cell.loading[[i, j]] - a_true[[i, j]]).abs() < 0.2,
                            "state {state} loading[{i}][{j}] = {}",
                            cell.loading[[i, j]]
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_noiseless_channel_map_limit() {
        // With Σw → 0 and A square invertible, the MAP estimate must
        // converge to A⁻¹(y − b) regardless of the prior.
        let a = array![[2.0, 0.0], [0.0, 4.0]];
        let b = array![1.0, -1.0];
        let cell = FactorCell {
            synthesis_mean: array![100.0, -100.0], // wildly wrong prior
            synthesis_covariance: array![[1.0, 0.0], [0.0, 1.0]],
            loading: a.clone(),
            bias: b.clone(),
            residual_covariance: array![[1e-9, 0.0], [0.0, 1e-9]],
        };
        let table = FactorTable {
            cells: vec![vec![Some(cell)]],
            synthesis_dim: 2,
        };

        let y = array![[5.0, 7.0]];
        let acoustics = FeatureSequence::new(y).unwrap();
        let xhat = reconstruct_synthesis(&table, 0, &[1], &acoustics).unwrap();

        // A⁻¹(y − b) = [(5−1)/2, (7+1)/4] = [2, 2]
        assert!((xhat.frame(0)[0] - 2.0).abs() < 1e-4);
        assert!((xhat.frame(0)[1] - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_reconstruct_rejects_path_length_mismatch() {
        let cell = FactorCell {
            synthesis_mean: array![0.0],
            synthesis_covariance: array![[1.0]],
            loading: array![[1.0]],
            bias: array![0.0],
            residual_covariance: array![[1.0]],
        };
        let table = FactorTable {
            cells: vec![vec![Some(cell)]],
            synthesis_dim: 1,
        };
        let acoustics = FeatureSequence::new(arr2(&[[1.0], [2.0]])).unwrap();
        assert!(matches!(
            reconstruct_synthesis(&table, 0, &[1], &acoustics),
            Err(HmmError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_reconstruct_missing_cell_is_reported() {
        let table = FactorTable {
            cells: vec![vec![None]],
            synthesis_dim: 1,
        };
        let acoustics = FeatureSequence::new(arr2(&[[1.0]])).unwrap();
        assert!(matches!(
            reconstruct_synthesis(&table, 0, &[1], &acoustics),
            Err(HmmError::MissingFactorCell { model: 0, state: 1 })
        ));
    }

    #[test]
    fn test_mismatched_synthesis_dims_rejected() {
        let set = paired_set();
        let mut corpus = paired_corpus();
        // Second utterance with a different synthesis dimensionality
        corpus.push(
            PairedUtterance::new(
                FeatureSequence::new(arr2(&[[0.0, 0.0], [5.0, 5.0]])).unwrap(),
                FeatureSequence::new(arr2(&[[1.0], [1.0]])).unwrap(),
                vec![0],
            )
            .unwrap(),
        );
        let estimator = LinearFactorReestimator::new(TrainingConfig::default());
        assert!(estimator.estimate(&set, &corpus).is_err());
    }
}
