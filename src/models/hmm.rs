//! Hidden Markov model with non-emitting entry/exit states
//!
//! The transition matrix is (S+2)×(S+2) in log domain: index 0 is the
//! non-emitting entry state, indices 1..=S are emitting states with one
//! mixture emission model each, and index S+1 is the non-emitting exit.

use ndarray::Array2;
use tracing::debug;

use crate::data::FeatureSequence;
use crate::error::{HmmError, Result};
use crate::math::logprob::{is_log_zero, log_add, safe_ln, LOG_ZERO};
use crate::models::gaussian::{Covariance, GaussianModel};
use crate::models::mixture::{MixtureComponent, MixtureModel};

/// Row-sum tolerance when validating a stochastic transition matrix.
const ROW_SUM_TOLERANCE: f64 = 1e-3;

/// Transition structure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Each emitting state reaches only itself and its successor;
    /// entry feeds state 1 only.
    LeftRightNoSkip,
    /// Transitions never move to a lower-indexed state.
    LeftRight,
    /// Anything else.
    Ergodic,
}

/// A continuous-density HMM.
#[derive(Debug, Clone)]
pub struct HmmModel {
    name: String,
    /// (S+2)×(S+2), log domain.
    log_transitions: Array2<f64>,
    /// One emission mixture per emitting state, index 0 ↔ state 1.
    states: Vec<MixtureModel>,
}

/// Result of Viterbi decoding one sequence.
#[derive(Debug, Clone)]
pub struct Alignment {
    /// Decoded emitting-state sequence, 1-based, length T.
    pub path: Vec<usize>,
    /// Average per-frame log-likelihood of the best path, or the
    /// log-domain zero sentinel when no valid traversal exists.
    pub score: f64,
}

impl Alignment {
    /// Whether decoding found a live path. A degenerate result keeps the
    /// zero sentinel as its score and must not be read as a valid
    /// low-probability alignment.
    pub fn is_path_found(&self) -> bool {
        !is_log_zero(self.score)
    }
}

impl HmmModel {
    /// Build a model from a probability-domain transition matrix and one
    /// emission mixture per emitting state.
    ///
    /// Rows 0..=S must be stochastic; a violation is a setup error that
    /// aborts construction. The exit row is conventionally either empty or
    /// a self-loop of one (a wire-format convention, accepted as-is).
    pub fn new(
        name: impl Into<String>,
        transitions: Array2<f64>,
        states: Vec<MixtureModel>,
    ) -> Result<Self> {
        let s = states.len();
        if s == 0 {
            return Err(HmmError::DimensionMismatch(
                "model needs at least one emitting state".into(),
            ));
        }
        let n = s + 2;
        if transitions.nrows() != n || transitions.ncols() != n {
            return Err(HmmError::DimensionMismatch(format!(
                "transition matrix is {}x{}, expected {n}x{n} for {s} emitting states",
                transitions.nrows(),
                transitions.ncols()
            )));
        }

        let dim = states[0].dim();
        for (i, st) in states.iter().enumerate() {
            if st.dim() != dim {
                return Err(HmmError::DimensionMismatch(format!(
                    "state {} has dim {}, expected {dim}",
                    i + 1,
                    st.dim()
                )));
            }
        }

        for row in 0..=s {
            let sum: f64 = transitions.row(row).sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                return Err(HmmError::InvalidTransitions { row, sum });
            }
        }

        let log_transitions = transitions.mapv(safe_ln);
        Ok(Self {
            name: name.into(),
            log_transitions,
            states,
        })
    }

    /// Left-right model without skips: entry feeds state 1, each state
    /// self-loops with `self_loop` probability, and the exit row carries
    /// the conventional self-loop of one.
    pub fn left_right_no_skip(
        name: impl Into<String>,
        self_loop: f64,
        states: Vec<MixtureModel>,
    ) -> Result<Self> {
        if !(0.0..1.0).contains(&self_loop) {
            return Err(HmmError::DimensionMismatch(format!(
                "self-loop probability {self_loop} outside [0, 1)"
            )));
        }
        let s = states.len();
        let n = s + 2;
        let mut transitions = Array2::zeros((n, n));
        transitions[[0, 1]] = 1.0;
        for i in 1..=s {
            transitions[[i, i]] = self_loop;
            transitions[[i, i + 1]] = 1.0 - self_loop;
        }
        transitions[[n - 1, n - 1]] = 1.0;
        Self::new(name, transitions, states)
    }

    /// Flat-start model: left-right-no-skip with every state sharing the
    /// corpus-global mean and variance. With more than one mixture
    /// component per state, means are deterministically staggered so EM can
    /// break the symmetry.
    pub fn flat_start(
        name: impl Into<String>,
        num_states: usize,
        num_mixtures: usize,
        global_mean: &ndarray::Array1<f64>,
        global_variance: &ndarray::Array1<f64>,
    ) -> Result<Self> {
        if num_states == 0 || num_mixtures == 0 {
            return Err(HmmError::DimensionMismatch(
                "flat start needs at least one state and one mixture".into(),
            ));
        }
        let mut states = Vec::with_capacity(num_states);
        for _ in 0..num_states {
            let mut components = Vec::with_capacity(num_mixtures);
            for m in 0..num_mixtures {
                let offset = if num_mixtures == 1 {
                    0.0
                } else {
                    (m as f64 - (num_mixtures as f64 - 1.0) / 2.0) * 0.2
                };
                let mean = global_mean + &global_variance.mapv(|v| v.sqrt() * offset);
                let gaussian =
                    GaussianModel::new(mean, Covariance::Diagonal(global_variance.clone()))?;
                components.push(MixtureComponent {
                    weight: 1.0 / num_mixtures as f64,
                    gaussian,
                });
            }
            states.push(MixtureModel::new(components)?);
        }
        Self::left_right_no_skip(name, 0.6, states)
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of emitting states S.
    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Index of the non-emitting exit state, S+1.
    pub fn exit_index(&self) -> usize {
        self.states.len() + 1
    }

    /// Feature dimensionality expected by the emission models.
    pub fn dim(&self) -> usize {
        self.states[0].dim()
    }

    /// Log-domain transition matrix.
    pub fn log_transitions(&self) -> &Array2<f64> {
        &self.log_transitions
    }

    /// Replace the transition matrix from probability domain, revalidating.
    pub fn set_transitions(&mut self, transitions: Array2<f64>) -> Result<()> {
        let s = self.num_states();
        let n = s + 2;
        if transitions.nrows() != n || transitions.ncols() != n {
            return Err(HmmError::DimensionMismatch(format!(
                "transition matrix is {}x{}, expected {n}x{n}",
                transitions.nrows(),
                transitions.ncols()
            )));
        }
        for row in 0..=s {
            let sum: f64 = transitions.row(row).sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                return Err(HmmError::InvalidTransitions { row, sum });
            }
        }
        self.log_transitions = transitions.mapv(safe_ln);
        Ok(())
    }

    /// Emission mixture of emitting state `i` (1-based).
    pub fn state(&self, i: usize) -> &MixtureModel {
        &self.states[i - 1]
    }

    /// Mutable emission mixture of emitting state `i` (1-based).
    pub fn state_mut(&mut self, i: usize) -> &mut MixtureModel {
        &mut self.states[i - 1]
    }

    /// Borrow all emission mixtures in state order.
    pub fn states(&self) -> &[MixtureModel] {
        &self.states
    }

    /// Classify the transition structure.
    pub fn topology(&self) -> Topology {
        let s = self.num_states();
        let a = &self.log_transitions;

        let mut no_skip = true;
        for j in 1..=s + 1 {
            if j != 1 && !is_log_zero(a[[0, j]]) {
                no_skip = false;
            }
        }
        for i in 1..=s {
            for j in 0..=s + 1 {
                if !is_log_zero(a[[i, j]]) && j != i && j != i + 1 {
                    no_skip = false;
                }
            }
        }
        if no_skip {
            return Topology::LeftRightNoSkip;
        }

        let mut left_right = true;
        for i in 0..=s {
            for j in 0..=s + 1 {
                if !is_log_zero(a[[i, j]]) && j < i.max(1) {
                    left_right = false;
                }
            }
        }
        if left_right {
            Topology::LeftRight
        } else {
            Topology::Ergodic
        }
    }

    /// Minimum number of frames a sequence must have to traverse this
    /// model from entry to exit.
    pub fn min_duration(&self) -> usize {
        let s = self.num_states();
        let a = &self.log_transitions;
        let exit = s + 1;
        let inf = usize::MAX;

        // Bellman-Ford over at most S+2 nodes; each emitting state visited
        // costs one frame.
        let mut dist = vec![inf; s + 2];
        dist[0] = 0;
        for _ in 0..s + 2 {
            let mut changed = false;
            for i in 0..=s {
                if dist[i] == inf {
                    continue;
                }
                for j in 1..=exit {
                    if is_log_zero(a[[i, j]]) || j == i {
                        continue;
                    }
                    let cost = if j == exit { 0 } else { 1 };
                    if dist[i] + cost < dist[j] {
                        dist[j] = dist[i] + cost;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        if dist[exit] == inf {
            // No route to exit at all; nothing can traverse this model.
            debug!("model {} has no entry-to-exit route", self.name);
            s.max(1)
        } else {
            dist[exit].max(1)
        }
    }

    /// Viterbi decoding of one sequence.
    ///
    /// Tie-breaks use strict `>` while scanning predecessors in increasing
    /// state order, so the lowest-indexed state wins exact ties. Dead paths
    /// short-circuit: the emission is not evaluated for a state whose best
    /// incoming score is already at the zero sentinel. The returned score
    /// is the average per-frame log-likelihood; a sequence with no valid
    /// traversal decodes to the zero sentinel, which callers must treat as
    /// "no path found".
    pub fn viterbi(&self, seq: &FeatureSequence) -> Result<Alignment> {
        if seq.dim() != self.dim() {
            return Err(HmmError::DimensionMismatch(format!(
                "sequence dim {} does not match model dim {}",
                seq.dim(),
                self.dim()
            )));
        }

        let s = self.num_states();
        let t_len = seq.len();
        let a = &self.log_transitions;
        let exit = s + 1;

        let mut prev = vec![LOG_ZERO; s];
        let mut curr = vec![LOG_ZERO; s];
        let mut psi = Array2::<usize>::zeros((t_len, s));

        // Initialization
        for j in 0..s {
            let entry = a[[0, j + 1]];
            prev[j] = if is_log_zero(entry) {
                LOG_ZERO
            } else {
                entry + self.states[j].log_density(seq.frame(0))
            };
        }

        // Recursion
        for t in 1..t_len {
            for j in 0..s {
                let mut best = LOG_ZERO;
                let mut best_state = 0usize;
                for i in 0..s {
                    let v = prev[i] + a[[i + 1, j + 1]];
                    if v > best {
                        best = v;
                        best_state = i;
                    }
                }
                psi[[t, j]] = best_state;
                curr[j] = if is_log_zero(best) {
                    LOG_ZERO
                } else {
                    best + self.states[j].log_density(seq.frame(t))
                };
            }
            std::mem::swap(&mut prev, &mut curr);
        }

        // Termination
        let mut best_total = LOG_ZERO;
        let mut best_final = 0usize;
        for i in 0..s {
            let v = prev[i] + a[[i + 1, exit]];
            if v > best_total {
                best_total = v;
                best_final = i;
            }
        }

        // Traceback
        let mut path = vec![0usize; t_len];
        path[t_len - 1] = best_final + 1;
        for t in (0..t_len - 1).rev() {
            path[t] = psi[[t + 1, path[t + 1] - 1]] + 1;
        }

        let score = if is_log_zero(best_total) {
            LOG_ZERO
        } else {
            best_total / t_len as f64
        };
        Ok(Alignment { path, score })
    }

    /// Forward-algorithm score: average per-frame log-likelihood of the
    /// sequence under this model, or the zero sentinel when no traversal
    /// exists.
    pub fn score(&self, seq: &FeatureSequence) -> Result<f64> {
        if seq.dim() != self.dim() {
            return Err(HmmError::DimensionMismatch(format!(
                "sequence dim {} does not match model dim {}",
                seq.dim(),
                self.dim()
            )));
        }

        let s = self.num_states();
        let t_len = seq.len();
        let a = &self.log_transitions;
        let exit = s + 1;

        let mut prev = vec![LOG_ZERO; s];
        let mut curr = vec![LOG_ZERO; s];

        for j in 0..s {
            let entry = a[[0, j + 1]];
            prev[j] = if is_log_zero(entry) {
                LOG_ZERO
            } else {
                entry + self.states[j].log_density(seq.frame(0))
            };
        }

        for t in 1..t_len {
            for j in 0..s {
                let mut acc = LOG_ZERO;
                for i in 0..s {
                    acc = log_add(acc, prev[i] + a[[i + 1, j + 1]]);
                }
                curr[j] = if is_log_zero(acc) {
                    LOG_ZERO
                } else {
                    acc + self.states[j].log_density(seq.frame(t))
                };
            }
            std::mem::swap(&mut prev, &mut curr);
        }

        let mut total = LOG_ZERO;
        for i in 0..s {
            total = log_add(total, prev[i] + a[[i + 1, exit]]);
        }

        if is_log_zero(total) {
            Ok(LOG_ZERO)
        } else {
            Ok(total / t_len as f64)
        }
    }
}

/// Run-length encode a decoded state sequence as (state, run) pairs.
pub fn encode_run_lengths(path: &[usize]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    for &state in path {
        match runs.last_mut() {
            Some((prev, count)) if *prev == state => *count += 1,
            _ => runs.push((state, 1)),
        }
    }
    runs
}

/// Expand (state, run) pairs back into a state sequence.
pub fn decode_run_lengths(runs: &[(usize, usize)]) -> Vec<usize> {
    let mut path = Vec::new();
    for &(state, count) in runs {
        path.extend(std::iter::repeat(state).take(count));
    }
    path
}

/// A collection of HMMs with an explicit logical→physical mapping.
///
/// Parameter sharing between logical models is a property of the mapping,
/// not of the model type: two logical indices pointing at one physical
/// model share parameters and training statistics.
#[derive(Debug, Clone)]
pub struct HmmSet {
    models: Vec<HmmModel>,
    logical_to_physical: Vec<usize>,
}

impl HmmSet {
    /// A set where every logical model is its own physical model.
    pub fn new(models: Vec<HmmModel>) -> Result<Self> {
        let mapping = (0..models.len()).collect();
        Self::with_mapping(models, mapping)
    }

    /// A set with an explicit logical→physical mapping table.
    pub fn with_mapping(models: Vec<HmmModel>, mapping: Vec<usize>) -> Result<Self> {
        if models.is_empty() {
            return Err(HmmError::DimensionMismatch(
                "model set needs at least one model".into(),
            ));
        }
        let dim = models[0].dim();
        for m in &models {
            if m.dim() != dim {
                return Err(HmmError::DimensionMismatch(format!(
                    "model {} has dim {}, expected {dim}",
                    m.name(),
                    m.dim()
                )));
            }
        }
        for &p in &mapping {
            if p >= models.len() {
                return Err(HmmError::ModelIndexOutOfRange {
                    index: p,
                    len: models.len(),
                });
            }
        }
        Ok(Self {
            models,
            logical_to_physical: mapping,
        })
    }

    /// Number of logical models.
    pub fn num_logical(&self) -> usize {
        self.logical_to_physical.len()
    }

    /// Number of physical models.
    pub fn num_physical(&self) -> usize {
        self.models.len()
    }

    /// Feature dimensionality shared by all models.
    pub fn dim(&self) -> usize {
        self.models[0].dim()
    }

    /// Physical index backing a logical model.
    pub fn physical_index(&self, logical: usize) -> Result<usize> {
        self.logical_to_physical
            .get(logical)
            .copied()
            .ok_or(HmmError::ModelIndexOutOfRange {
                index: logical,
                len: self.logical_to_physical.len(),
            })
    }

    /// The model behind a logical index.
    pub fn model(&self, logical: usize) -> Result<&HmmModel> {
        Ok(&self.models[self.physical_index(logical)?])
    }

    /// Borrow a physical model directly.
    pub fn physical_model(&self, physical: usize) -> &HmmModel {
        &self.models[physical]
    }

    /// Mutable access to a physical model for reestimation.
    pub fn physical_model_mut(&mut self, physical: usize) -> &mut HmmModel {
        &mut self.models[physical]
    }

    /// The mapping table.
    pub fn mapping(&self) -> &[usize] {
        &self.logical_to_physical
    }

    /// Classify a sequence: the logical model with the best average
    /// per-frame log-likelihood, together with that score.
    ///
    /// Fails with [`HmmError::NoPath`] when no model in the set can
    /// traverse the sequence at all.
    pub fn classify(&self, seq: &FeatureSequence) -> Result<(usize, f64)> {
        let mut best = LOG_ZERO;
        let mut best_index = 0usize;
        for logical in 0..self.num_logical() {
            let score = self.model(logical)?.score(seq)?;
            if score > best {
                best = score;
                best_index = logical;
            }
        }
        if is_log_zero(best) {
            return Err(HmmError::NoPath);
        }
        Ok((best_index, best))
    }
}
