//! Embedded Baum-Welch reestimation over a corpus
//!
//! One EM iteration walks every utterance through the forward-backward
//! engine, routes the occupation posteriors into the accumulator arena
//! keyed by physical model, then converts the accumulated statistics into
//! new model parameters. Utterances that cannot be analyzed are skipped
//! and counted, never fatal; cells with zero occupation keep their
//! previous parameters and are reported.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::config::TrainingConfig;
use crate::data::Corpus;
use crate::error::Result;
use crate::models::{Covariance, HmmSet};
use crate::train::accumulators::AccumulatorArena;
use crate::train::forward_backward::{ForwardBackwardEngine, Lattice};

/// Occupation below which a posterior contributes nothing worth streaming.
const MIN_POSTERIOR: f64 = 1e-10;

/// Cooperative cancellation for a training run, checked once per
/// utterance so a stuck utterance never blocks the whole pass.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the pass stops before its next utterance.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Outcome of one EM iteration over the corpus.
#[derive(Debug, Clone)]
pub struct PassReport {
    /// 1-based iteration number.
    pub iteration: usize,
    /// Utterances in the corpus.
    pub total_utterances: usize,
    /// Utterances that contributed statistics.
    pub used_utterances: usize,
    /// Skipped: shorter than the chain's minimum traversal length.
    pub skipped_short: usize,
    /// Skipped: pruning beam collapsed during analysis.
    pub skipped_beam: usize,
    /// Frames accumulated.
    pub frames: usize,
    /// Average per-frame log-likelihood over the used utterances.
    pub avg_log_likelihood: f64,
    /// Cells that kept previous parameters for lack of occupation,
    /// as (physical model, state) pairs.
    pub zero_occupation_cells: Vec<(usize, usize)>,
    /// Covariance updates rejected by the floor check,
    /// as (physical model, state, mixture) triples.
    pub rejected_covariances: Vec<(usize, usize, usize)>,
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iteration {}: avg log-likelihood {:.4} over {} frames; \
             {} of {} utterances skipped ({} too short, {} beam collapse); \
             {} zero-occupation cell(s), {} rejected covariance update(s)",
            self.iteration,
            self.avg_log_likelihood,
            self.frames,
            self.skipped_short + self.skipped_beam,
            self.total_utterances,
            self.skipped_short,
            self.skipped_beam,
            self.zero_occupation_cells.len(),
            self.rejected_covariances.len(),
        )
    }
}

/// Outcome of a full training run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub passes: Vec<PassReport>,
    /// Whether the convergence threshold was reached before the
    /// iteration limit.
    pub converged: bool,
    /// Whether the run stopped on a cancellation request.
    pub cancelled: bool,
}

impl TrainingReport {
    /// Average log-likelihood of the final pass, if any pass ran.
    pub fn final_log_likelihood(&self) -> Option<f64> {
        self.passes.last().map(|p| p.avg_log_likelihood)
    }
}

/// Drives embedded Baum-Welch reestimation passes over a corpus.
pub struct EmbeddedReestimator {
    config: TrainingConfig,
}

impl EmbeddedReestimator {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    /// Run EM iterations until convergence, the iteration limit, or
    /// cancellation.
    pub fn train(&self, set: &mut HmmSet, corpus: &Corpus) -> Result<TrainingReport> {
        self.train_with_cancel(set, corpus, &CancelToken::new())
    }

    /// [`train`](Self::train) with an external cancellation token.
    pub fn train_with_cancel(
        &self,
        set: &mut HmmSet,
        corpus: &Corpus,
        cancel: &CancelToken,
    ) -> Result<TrainingReport> {
        let mut passes = Vec::new();
        let mut converged = false;
        let mut prev_avg: Option<f64> = None;

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                info!("training cancelled before iteration {iteration}");
                return Ok(TrainingReport {
                    passes,
                    converged,
                    cancelled: true,
                });
            }

            let report = self.run_pass(set, corpus, iteration, cancel)?;
            info!("{report}");
            let avg = report.avg_log_likelihood;
            passes.push(report);

            if cancel.is_cancelled() {
                return Ok(TrainingReport {
                    passes,
                    converged,
                    cancelled: true,
                });
            }

            if let Some(prev) = prev_avg {
                if (avg - prev).abs() <= self.config.convergence_threshold {
                    converged = true;
                    info!("converged after {iteration} iterations");
                    break;
                }
            }
            prev_avg = Some(avg);
        }

        Ok(TrainingReport {
            passes,
            converged,
            cancelled: false,
        })
    }

    /// One EM iteration: accumulate over the whole corpus, then
    /// reestimate every cell.
    pub fn run_pass(
        &self,
        set: &mut HmmSet,
        corpus: &Corpus,
        iteration: usize,
        cancel: &CancelToken,
    ) -> Result<PassReport> {
        let mut arena = AccumulatorArena::for_set(set);
        let mut report = PassReport {
            iteration,
            total_utterances: corpus.len(),
            used_utterances: 0,
            skipped_short: 0,
            skipped_beam: 0,
            frames: 0,
            avg_log_likelihood: 0.0,
            zero_occupation_cells: Vec::new(),
            rejected_covariances: Vec::new(),
        };
        let mut total_log_prob = 0.0;

        {
            let engine = ForwardBackwardEngine::new(set, &self.config);
            for (index, utterance) in corpus.utterances.iter().enumerate() {
                if cancel.is_cancelled() {
                    info!("pass cancelled at utterance {index}");
                    break;
                }

                let lattice =
                    match engine.analyze(&utterance.features, &utterance.transcription) {
                        Ok(lattice) => lattice,
                        Err(e) if e.is_recoverable() => {
                            warn!("utterance {index} skipped: {e}");
                            match e {
                                crate::error::HmmError::TooShort { .. } => {
                                    report.skipped_short += 1
                                }
                                _ => report.skipped_beam += 1,
                            }
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                accumulate(set, &lattice, utterance.features.frames(), &mut arena);
                report.used_utterances += 1;
                report.frames += lattice.num_frames();
                total_log_prob += lattice.log_prob();
            }
        }

        report.avg_log_likelihood = if report.frames > 0 {
            total_log_prob / report.frames as f64
        } else {
            0.0
        };

        self.apply(&arena, set, &mut report)?;
        Ok(report)
    }

    /// Convert accumulated statistics into new parameters for every cell.
    fn apply(
        &self,
        arena: &AccumulatorArena,
        set: &mut HmmSet,
        report: &mut PassReport,
    ) -> Result<()> {
        for (p, cell) in arena.models.iter().enumerate() {
            // Transitions: occupied rows renormalize, the rest are kept.
            let model = set.physical_model_mut(p);
            let mut transitions = model.log_transitions().mapv(f64::exp);
            if cell.transitions.reestimate(&mut transitions) {
                model.set_transitions(transitions)?;
            }

            for (s, state_cell) in cell.states.iter().enumerate() {
                let state_index = s + 1;
                if state_cell.occupation <= 0.0 {
                    debug!("model {p} state {state_index}: zero occupation, parameters retained");
                    report.zero_occupation_cells.push((p, state_index));
                    continue;
                }

                let mixture = set.physical_model_mut(p).state_mut(state_index);
                for (m, mix_cell) in state_cell.mixtures.iter().enumerate() {
                    let occupation = mix_cell.mean.occupation();
                    let component = &mut mixture.components_mut()[m];

                    if occupation <= 0.0 {
                        report.zero_occupation_cells.push((p, state_index));
                        continue;
                    }

                    let mut mean = component.gaussian.mean().clone();
                    let mean_ok = mix_cell.mean.reestimate(&mut mean);

                    let mut covariance = match component.gaussian.covariance() {
                        Covariance::Full(cov) => cov.clone(),
                        Covariance::Diagonal(vars) => Array2::from_diag(vars),
                    };
                    let cov_ok = mix_cell.covariance.reestimate(
                        &mut covariance,
                        self.config.covariance_floor,
                        self.config.min_covariance,
                    );
                    if !cov_ok {
                        report.rejected_covariances.push((p, state_index, m));
                    }

                    if mean_ok {
                        let new_cov = match component.gaussian.covariance() {
                            Covariance::Full(_) => Covariance::Full(covariance),
                            Covariance::Diagonal(_) => {
                                Covariance::Diagonal(covariance.diag().to_owned())
                            }
                        };
                        component.gaussian.set_parameters(mean, new_cov)?;
                    }

                    component.weight = occupation / state_cell.occupation;
                }

                mixture.prune_negligible(self.config.mixture_prune_threshold);
            }
        }
        Ok(())
    }
}

/// Route one lattice's posteriors into the arena.
///
/// State-level occupation feeds the transition statistics; mixture-level
/// occupation, split by each component's share of the state emission,
/// feeds the mean and covariance cells.
fn accumulate(
    set: &HmmSet,
    lattice: &Lattice,
    frames: &Array2<f64>,
    arena: &mut AccumulatorArena,
) {
    let chain = lattice.chain();
    let n = chain.num_states();
    let t_len = lattice.num_frames();
    let a = chain.log_transitions();
    let log_prob = lattice.log_prob();

    // Emission statistics from gamma
    for t in 0..t_len {
        let frame = frames.row(t);
        for g in 0..n {
            let gamma = lattice.gamma(t, g);
            if gamma < MIN_POSTERIOR {
                continue;
            }
            let cs = chain.state(g);
            let mixture = set.physical_model(cs.physical).state(cs.local);
            let state_cell = &mut arena.models[cs.physical].states[cs.local - 1];
            state_cell.occupation += gamma;

            if mixture.num_components() == 1 {
                state_cell.mixtures[0].mean.update(gamma, frame);
                state_cell.mixtures[0].covariance.update(gamma, frame);
            } else {
                let component_logs = mixture.component_log_densities(frame);
                let total = mixture.log_density(frame);
                for (m, &cl) in component_logs.iter().enumerate() {
                    let share = (cl - total).exp();
                    let weight = gamma * share;
                    if weight < MIN_POSTERIOR {
                        continue;
                    }
                    state_cell.mixtures[m].mean.update(weight, frame);
                    state_cell.mixtures[m].covariance.update(weight, frame);
                }
            }
        }
    }

    // Entry occupation at the first frame
    for g in 0..n {
        let gamma = lattice.gamma(0, g);
        if gamma < MIN_POSTERIOR {
            continue;
        }
        let cs = chain.state(g);
        arena.models[cs.physical]
            .transitions
            .add(0, cs.local, gamma);
    }

    // Transition occupation between frames
    for t in 0..t_len - 1 {
        for g in 0..n {
            let la = lattice.log_alpha(t, g);
            if crate::math::logprob::is_log_zero(la) {
                continue;
            }
            let from = chain.state(g);
            for h in 0..n {
                let lt = a[[g + 1, h + 1]];
                let lb = lattice.log_beta(t + 1, h);
                if crate::math::logprob::is_log_zero(lt)
                    || crate::math::logprob::is_log_zero(lb)
                {
                    continue;
                }
                let xi = (la + lt + lattice.log_emission(t + 1, h) + lb - log_prob).exp();
                if xi < MIN_POSTERIOR {
                    continue;
                }
                let to = chain.state(h);
                if from.position == to.position {
                    arena.models[from.physical]
                        .transitions
                        .add(from.local, to.local, xi);
                } else {
                    // Crossing between chain positions: credit the source
                    // model's exit and the target model's entry.
                    let from_model = set.physical_model(from.physical);
                    arena.models[from.physical].transitions.add(
                        from.local,
                        from_model.exit_index(),
                        xi,
                    );
                    arena.models[to.physical].transitions.add(0, to.local, xi);
                }
            }
        }
    }

    // Exit occupation at the last frame
    let exit = n + 1;
    for g in 0..n {
        let la = lattice.log_alpha(t_len - 1, g);
        let lt = a[[g + 1, exit]];
        if crate::math::logprob::is_log_zero(la) || crate::math::logprob::is_log_zero(lt) {
            continue;
        }
        let xi = (la + lt - log_prob).exp();
        if xi < MIN_POSTERIOR {
            continue;
        }
        let cs = chain.state(g);
        let model = set.physical_model(cs.physical);
        arena.models[cs.physical]
            .transitions
            .add(cs.local, model.exit_index(), xi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FeatureSequence, Utterance};
    use crate::models::{Covariance, GaussianModel, HmmModel, MixtureModel};
    use ndarray::{arr2, array, Array2 as Nd2};

    fn gaussian_state(mean: f64, var: f64) -> MixtureModel {
        MixtureModel::single(
            GaussianModel::new(array![mean], Covariance::Diagonal(array![var])).unwrap(),
        )
    }

    fn training_corpus() -> Corpus {
        // Sequences that sit in 0-land then 5-land, matching a two-state
        // left-right model.
        let mut utterances = Vec::new();
        let raw: Vec<Vec<f64>> = vec![
            vec![0.1, -0.2, 0.3, 4.8, 5.1, 5.3],
            vec![-0.1, 0.2, 5.0, 4.9, 5.2],
            vec![0.0, 0.1, -0.3, 0.2, 4.7, 5.0, 5.1],
            vec![0.2, -0.1, 4.9, 5.0],
        ];
        for values in raw {
            let data =
                Nd2::from_shape_vec((values.len(), 1), values).expect("shape matches data");
            utterances.push(
                Utterance::new(FeatureSequence::new(data).unwrap(), vec![0]).unwrap(),
            );
        }
        Corpus::new(utterances)
    }

    fn initial_set() -> HmmSet {
        let model = HmmModel::left_right_no_skip(
            "word",
            0.5,
            vec![gaussian_state(1.0, 2.0), gaussian_state(4.0, 2.0)],
        )
        .unwrap();
        HmmSet::new(vec![model]).unwrap()
    }

    #[test]
    fn test_one_pass_improves_average_likelihood() {
        let mut set = initial_set();
        let corpus = training_corpus();
        let config = TrainingConfig::default().with_max_iterations(1);
        let trainer = EmbeddedReestimator::new(config.clone());

        let before = trainer
            .run_pass(&mut set.clone(), &corpus, 1, &CancelToken::new())
            .unwrap()
            .avg_log_likelihood;

        // One full reestimation, then measure again
        trainer.train(&mut set, &corpus).unwrap();
        let after = trainer
            .run_pass(&mut set.clone(), &corpus, 1, &CancelToken::new())
            .unwrap()
            .avg_log_likelihood;

        assert!(
            after >= before - 1e-6,
            "EM should not reduce the average log-likelihood: {before} -> {after}"
        );
    }

    #[test]
    fn test_training_converges_and_reports() {
        let mut set = initial_set();
        let corpus = training_corpus();
        let trainer = EmbeddedReestimator::new(
            TrainingConfig::default()
                .with_max_iterations(30)
                .with_convergence_threshold(1e-5),
        );

        let report = trainer.train(&mut set, &corpus).unwrap();
        assert!(!report.passes.is_empty());
        assert!(!report.cancelled);
        assert!(report.final_log_likelihood().unwrap().is_finite());

        // The trained means should have moved toward the data clusters.
        let m = set.physical_model(0);
        let mean0 = m.state(1).components()[0].gaussian.mean()[0];
        let mean1 = m.state(2).components()[0].gaussian.mean()[0];
        assert!(mean0 < 1.0, "state 1 mean {mean0} should approach 0");
        assert!(mean1 > 4.0, "state 2 mean {mean1} should approach 5");
    }

    #[test]
    fn test_short_utterances_are_skipped_not_fatal() {
        let mut set = initial_set();
        let mut corpus = training_corpus();
        // One frame cannot traverse the two mandatory states.
        corpus.utterances.push(
            Utterance::new(
                FeatureSequence::new(arr2(&[[0.0]])).unwrap(),
                vec![0],
            )
            .unwrap(),
        );

        let trainer =
            EmbeddedReestimator::new(TrainingConfig::default().with_max_iterations(1));
        let report = trainer
            .run_pass(&mut set, &corpus, 1, &CancelToken::new())
            .unwrap();

        assert_eq!(report.skipped_short, 1);
        assert_eq!(report.used_utterances, report.total_utterances - 1);
        let text = report.to_string();
        assert!(text.contains("1 of 5 utterances skipped"));
    }

    #[test]
    fn test_cancel_stops_before_next_utterance() {
        let mut set = initial_set();
        let corpus = training_corpus();
        let trainer =
            EmbeddedReestimator::new(TrainingConfig::default().with_max_iterations(50));

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = trainer
            .train_with_cancel(&mut set, &corpus, &cancel)
            .unwrap();
        assert!(report.cancelled);
        assert!(report.passes.is_empty());
    }

    #[test]
    fn test_transition_rows_stay_stochastic_after_reestimation() {
        let mut set = initial_set();
        let corpus = training_corpus();
        let trainer =
            EmbeddedReestimator::new(TrainingConfig::default().with_max_iterations(2));
        trainer.train(&mut set, &corpus).unwrap();

        let transitions = set.physical_model(0).log_transitions().mapv(f64::exp);
        for row in 0..=set.physical_model(0).num_states() {
            let sum: f64 = transitions.row(row).sum();
            assert!((sum - 1.0).abs() < 1e-6, "row {row} sums to {sum}");
        }
    }

    #[test]
    fn test_shared_physical_model_receives_all_statistics() {
        // Two logical models both mapped to one physical model: the
        // statistics of both transcription symbols flow into it.
        let model = HmmModel::left_right_no_skip(
            "shared",
            0.5,
            vec![gaussian_state(1.0, 2.0), gaussian_state(4.0, 2.0)],
        )
        .unwrap();
        let mut set = HmmSet::with_mapping(vec![model], vec![0, 0]).unwrap();

        let data = arr2(&[
            [0.1],
            [5.0],
            [0.0],
            [5.1],
        ]);
        let corpus = Corpus::new(vec![Utterance::new(
            FeatureSequence::new(data).unwrap(),
            vec![0, 1],
        )
        .unwrap()]);

        let trainer =
            EmbeddedReestimator::new(TrainingConfig::default().with_max_iterations(1));
        let report = trainer.train(&mut set, &corpus).unwrap();
        assert_eq!(report.passes[0].used_utterances, 1);
    }
}
