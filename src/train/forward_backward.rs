//! Pruned forward-backward analysis of one utterance
//!
//! An utterance spans a chain of models named by its transcription. The
//! chain is composed into one flat state list with a combined log-domain
//! transition matrix, then backward (beta) probabilities are computed
//! first and forward (alpha) probabilities are combined with them to yield
//! per-frame state occupation posteriors.
//!
//! A beam bounds which states are evaluated at each frame: states whose
//! log probability falls more than the beam width below the frame's best
//! are treated as zero. If the beam collapses to no live states the
//! utterance is reported as a recoverable error and skipped by callers.

use ndarray::Array2;

use crate::config::TrainingConfig;
use crate::data::FeatureSequence;
use crate::error::{HmmError, Result};
use crate::math::logprob::{is_log_zero, log_add, LOG_ZERO};
use crate::models::HmmSet;

/// One emitting state of a composed model chain.
#[derive(Debug, Clone, Copy)]
pub struct CompositeState {
    /// Position in the transcription.
    pub position: usize,
    /// Physical model index.
    pub physical: usize,
    /// 1-based emitting state index within that model.
    pub local: usize,
}

/// A transcription's models flattened into one state chain.
#[derive(Debug, Clone)]
pub struct CompositeChain {
    states: Vec<CompositeState>,
    /// (N+2)×(N+2) log-domain transitions; 0 is chain entry, N+1 chain exit.
    log_trans: Array2<f64>,
    min_duration: usize,
}

impl CompositeChain {
    /// Number of composite emitting states.
    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Identify composite state `g` (0-based).
    pub fn state(&self, g: usize) -> CompositeState {
        self.states[g]
    }

    /// Minimum number of frames needed to traverse the whole chain.
    pub fn min_duration(&self) -> usize {
        self.min_duration
    }

    /// Combined log-domain transition matrix.
    pub fn log_transitions(&self) -> &Array2<f64> {
        &self.log_trans
    }
}

/// Compose the models named by a transcription into one chain.
pub fn compose(set: &HmmSet, transcription: &[usize]) -> Result<CompositeChain> {
    let physicals: Vec<usize> = transcription
        .iter()
        .map(|&logical| set.physical_index(logical))
        .collect::<Result<_>>()?;

    let mut states = Vec::new();
    let mut offsets = Vec::with_capacity(physicals.len());
    for (position, &physical) in physicals.iter().enumerate() {
        offsets.push(states.len());
        let model = set.physical_model(physical);
        for local in 1..=model.num_states() {
            states.push(CompositeState {
                position,
                physical,
                local,
            });
        }
    }

    let n = states.len();
    let q_len = physicals.len();
    let mut log_trans = Array2::from_elem((n + 2, n + 2), LOG_ZERO);

    // Per-model entry-to-exit passthrough cost (tee models).
    let thru: Vec<f64> = physicals
        .iter()
        .map(|&p| {
            let m = set.physical_model(p);
            m.log_transitions()[[0, m.exit_index()]]
        })
        .collect();

    // Chain entry into each position, chained through any passthroughs.
    let mut acc = 0.0;
    for q in 0..q_len {
        let m = set.physical_model(physicals[q]);
        let a = m.log_transitions();
        for j in 1..=m.num_states() {
            if !is_log_zero(acc) && !is_log_zero(a[[0, j]]) {
                log_trans[[0, offsets[q] + j]] = acc + a[[0, j]];
            }
        }
        acc += thru[q];
        if is_log_zero(acc) {
            break;
        }
    }

    // Suffix passthrough cost from just after each position to chain exit.
    let mut tail = vec![0.0; q_len];
    for q in (0..q_len.saturating_sub(1)).rev() {
        tail[q] = thru[q + 1] + tail[q + 1];
    }

    for q in 0..q_len {
        let m = set.physical_model(physicals[q]);
        let a = m.log_transitions();
        let s = m.num_states();
        for i in 1..=s {
            let g = offsets[q] + i;

            // Within-model transitions
            for j in 1..=s {
                log_trans[[g, offsets[q] + j]] = a[[i, j]];
            }

            let leave = a[[i, m.exit_index()]];
            if is_log_zero(leave) {
                continue;
            }

            // Into following positions, through any passthroughs
            let mut acc = leave;
            for q_next in q + 1..q_len {
                let next = set.physical_model(physicals[q_next]);
                let a_next = next.log_transitions();
                for j in 1..=next.num_states() {
                    if !is_log_zero(a_next[[0, j]]) {
                        log_trans[[g, offsets[q_next] + j]] = acc + a_next[[0, j]];
                    }
                }
                acc += thru[q_next];
                if is_log_zero(acc) {
                    break;
                }
            }

            // To chain exit
            let to_exit = leave + tail[q];
            if !is_log_zero(to_exit) {
                log_trans[[g, n + 1]] = to_exit;
            }
        }
    }

    let min_duration = min_traversal(&log_trans);
    Ok(CompositeChain {
        states,
        log_trans,
        min_duration,
    })
}

/// Minimum emitting-frame count from entry to exit of a log-domain
/// transition matrix, by relaxation.
fn min_traversal(log_trans: &Array2<f64>) -> usize {
    let n = log_trans.nrows() - 2;
    let exit = n + 1;
    let inf = usize::MAX;

    let mut dist = vec![inf; n + 2];
    dist[0] = 0;
    for _ in 0..n + 2 {
        let mut changed = false;
        for i in 0..=n {
            if dist[i] == inf {
                continue;
            }
            for j in 1..=exit {
                if j == i || is_log_zero(log_trans[[i, j]]) {
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
        n.max(1)
    } else {
        dist[exit].max(1)
    }
}

/// Forward/backward lattices and occupation posteriors for one utterance.
#[derive(Debug)]
pub struct Lattice {
    chain: CompositeChain,
    alpha: Array2<f64>,
    beta: Array2<f64>,
    log_emissions: Array2<f64>,
    log_prob: f64,
}

impl Lattice {
    /// The composed chain this lattice was built over.
    pub fn chain(&self) -> &CompositeChain {
        &self.chain
    }

    /// Number of frames.
    pub fn num_frames(&self) -> usize {
        self.alpha.nrows()
    }

    /// Total log-likelihood of the utterance.
    pub fn log_prob(&self) -> f64 {
        self.log_prob
    }

    /// Average per-frame log-likelihood.
    pub fn avg_log_prob(&self) -> f64 {
        self.log_prob / self.num_frames() as f64
    }

    /// Forward log probability at (frame, composite state).
    pub fn log_alpha(&self, t: usize, g: usize) -> f64 {
        self.alpha[[t, g]]
    }

    /// Backward log probability at (frame, composite state).
    pub fn log_beta(&self, t: usize, g: usize) -> f64 {
        self.beta[[t, g]]
    }

    /// Cached emission log-density at (frame, composite state). States
    /// never reached inside the beam report the zero sentinel.
    pub fn log_emission(&self, t: usize, g: usize) -> f64 {
        self.log_emissions[[t, g]]
    }

    /// State occupation posterior gamma(t, g) in linear probability.
    pub fn gamma(&self, t: usize, g: usize) -> f64 {
        let lg = self.alpha[[t, g]] + self.beta[[t, g]] - self.log_prob;
        if is_log_zero(self.alpha[[t, g]]) || is_log_zero(self.beta[[t, g]]) {
            0.0
        } else {
            lg.exp()
        }
    }
}

/// Caches emission log-densities so each (frame, state) pair is evaluated
/// at most once, and only when some lattice path actually needs it.
struct EmissionCache {
    values: Array2<f64>,
    computed: Array2<bool>,
}

impl EmissionCache {
    fn new(frames: usize, states: usize) -> Self {
        Self {
            values: Array2::from_elem((frames, states), LOG_ZERO),
            computed: Array2::from_elem((frames, states), false),
        }
    }

    fn get(
        &mut self,
        t: usize,
        g: usize,
        set: &HmmSet,
        chain: &CompositeChain,
        seq: &FeatureSequence,
    ) -> f64 {
        if !self.computed[[t, g]] {
            let cs = chain.state(g);
            let mixture = set.physical_model(cs.physical).state(cs.local);
            self.values[[t, g]] = mixture.log_density(seq.frame(t));
            self.computed[[t, g]] = true;
        }
        self.values[[t, g]]
    }
}

/// Prune one lattice row in place against the beam; returns false when no
/// state survives.
fn prune_row(row: &mut [f64], beam: f64) -> bool {
    let mut best = LOG_ZERO;
    for &v in row.iter() {
        if v > best {
            best = v;
        }
    }
    if is_log_zero(best) {
        return false;
    }
    let threshold = best - beam;
    for v in row.iter_mut() {
        if *v < threshold {
            *v = LOG_ZERO;
        }
    }
    true
}

/// Computes pruned forward/backward lattices over single utterances.
pub struct ForwardBackwardEngine<'a> {
    set: &'a HmmSet,
    config: &'a TrainingConfig,
}

impl<'a> ForwardBackwardEngine<'a> {
    pub fn new(set: &'a HmmSet, config: &'a TrainingConfig) -> Self {
        Self { set, config }
    }

    /// Analyze one utterance, producing its occupation lattice.
    ///
    /// Recoverable failures: [`HmmError::TooShort`] when the sequence
    /// cannot traverse the chain, [`HmmError::BeamCollapse`] when pruning
    /// leaves no live state at some frame.
    pub fn analyze(
        &self,
        features: &FeatureSequence,
        transcription: &[usize],
    ) -> Result<Lattice> {
        if features.dim() != self.set.dim() {
            return Err(HmmError::DimensionMismatch(format!(
                "sequence dim {} does not match model dim {}",
                features.dim(),
                self.set.dim()
            )));
        }

        let chain = compose(self.set, transcription)?;
        let t_len = features.len();
        if t_len < chain.min_duration() {
            return Err(HmmError::TooShort {
                len: t_len,
                min: chain.min_duration(),
            });
        }

        let n = chain.num_states();
        let a = &chain.log_trans;
        let exit = n + 1;
        let beam = self.config.beam;
        let mut emissions = EmissionCache::new(t_len, n);

        // Backward pass first
        let mut beta = Array2::from_elem((t_len, n), LOG_ZERO);
        for g in 0..n {
            beta[[t_len - 1, g]] = a[[g + 1, exit]];
        }
        {
            let mut row = beta.row_mut(t_len - 1);
            if !prune_row(row.as_slice_mut().expect("row is contiguous"), beam) {
                return Err(HmmError::BeamCollapse { frame: t_len - 1 });
            }
        }

        for t in (0..t_len - 1).rev() {
            for g in 0..n {
                let mut acc = LOG_ZERO;
                for h in 0..n {
                    if is_log_zero(beta[[t + 1, h]]) || is_log_zero(a[[g + 1, h + 1]]) {
                        continue;
                    }
                    let b = emissions.get(t + 1, h, self.set, &chain, features);
                    acc = log_add(acc, a[[g + 1, h + 1]] + b + beta[[t + 1, h]]);
                }
                beta[[t, g]] = acc;
            }
            let mut row = beta.row_mut(t);
            if !prune_row(row.as_slice_mut().expect("row is contiguous"), beam) {
                return Err(HmmError::BeamCollapse { frame: t });
            }
        }

        // Total likelihood from the beta lattice
        let mut log_prob = LOG_ZERO;
        for g in 0..n {
            if is_log_zero(a[[0, g + 1]]) || is_log_zero(beta[[0, g]]) {
                continue;
            }
            let b = emissions.get(0, g, self.set, &chain, features);
            log_prob = log_add(log_prob, a[[0, g + 1]] + b + beta[[0, g]]);
        }
        if is_log_zero(log_prob) {
            return Err(HmmError::BeamCollapse { frame: 0 });
        }

        // Forward pass, combined with beta for the posteriors
        let mut alpha = Array2::from_elem((t_len, n), LOG_ZERO);
        for g in 0..n {
            if !is_log_zero(a[[0, g + 1]]) {
                let b = emissions.get(0, g, self.set, &chain, features);
                alpha[[0, g]] = a[[0, g + 1]] + b;
            }
        }
        {
            let mut row = alpha.row_mut(0);
            if !prune_row(row.as_slice_mut().expect("row is contiguous"), beam) {
                return Err(HmmError::BeamCollapse { frame: 0 });
            }
        }

        for t in 1..t_len {
            for g in 0..n {
                let mut acc = LOG_ZERO;
                for h in 0..n {
                    if is_log_zero(alpha[[t - 1, h]]) || is_log_zero(a[[h + 1, g + 1]]) {
                        continue;
                    }
                    acc = log_add(acc, alpha[[t - 1, h]] + a[[h + 1, g + 1]]);
                }
                if !is_log_zero(acc) {
                    let b = emissions.get(t, g, self.set, &chain, features);
                    alpha[[t, g]] = acc + b;
                }
            }
            let mut row = alpha.row_mut(t);
            if !prune_row(row.as_slice_mut().expect("row is contiguous"), beam) {
                return Err(HmmError::BeamCollapse { frame: t });
            }
        }

        Ok(Lattice {
            chain,
            alpha,
            beta,
            log_emissions: emissions.values,
            log_prob,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GaussianModel, HmmModel, MixtureModel};
    use ndarray::{arr2, array};

    fn gaussian_state(mean: f64) -> MixtureModel {
        MixtureModel::single(GaussianModel::with_identity(array![mean]))
    }

    fn two_state_set() -> HmmSet {
        let model = HmmModel::left_right_no_skip(
            "m0",
            0.5,
            vec![gaussian_state(0.0), gaussian_state(5.0)],
        )
        .unwrap();
        HmmSet::new(vec![model]).unwrap()
    }

    #[test]
    fn test_compose_single_model() {
        let set = two_state_set();
        let chain = compose(&set, &[0]).unwrap();
        assert_eq!(chain.num_states(), 2);
        assert_eq!(chain.min_duration(), 2);
        let cs = chain.state(1);
        assert_eq!(cs.physical, 0);
        assert_eq!(cs.local, 2);
    }

    #[test]
    fn test_compose_chains_models() {
        let set = two_state_set();
        let chain = compose(&set, &[0, 0]).unwrap();
        assert_eq!(chain.num_states(), 4);
        assert_eq!(chain.min_duration(), 4);

        // Cross-model link: last state of position 0 reaches first state of
        // position 1 with cost exit + entry.
        let a = chain.log_transitions();
        assert!(!is_log_zero(a[[2, 3]]));
        // But not backwards
        assert!(is_log_zero(a[[3, 2]]));
    }

    #[test]
    fn test_compose_rejects_unknown_model() {
        let set = two_state_set();
        assert!(matches!(
            compose(&set, &[0, 7]),
            Err(HmmError::ModelIndexOutOfRange { index: 7, .. })
        ));
    }

    #[test]
    fn test_gamma_rows_sum_to_one() {
        let set = two_state_set();
        let config = TrainingConfig::default();
        let engine = ForwardBackwardEngine::new(&set, &config);

        let seq = FeatureSequence::new(arr2(&[[0.1], [-0.1], [4.8], [5.2]])).unwrap();
        let lattice = engine.analyze(&seq, &[0]).unwrap();

        for t in 0..lattice.num_frames() {
            let total: f64 = (0..lattice.chain().num_states())
                .map(|g| lattice.gamma(t, g))
                .sum();
            assert!((total - 1.0).abs() < 1e-6, "frame {t} sums to {total}");
        }
    }

    #[test]
    fn test_log_prob_matches_model_score() {
        let set = two_state_set();
        let config = TrainingConfig::default();
        let engine = ForwardBackwardEngine::new(&set, &config);

        let seq = FeatureSequence::new(arr2(&[[0.0], [0.5], [4.5], [5.0]])).unwrap();
        let lattice = engine.analyze(&seq, &[0]).unwrap();
        let score = set.physical_model(0).score(&seq).unwrap();

        assert!((lattice.avg_log_prob() - score).abs() < 1e-6);
    }

    #[test]
    fn test_too_short_utterance_is_recoverable() {
        let set = two_state_set();
        let config = TrainingConfig::default();
        let engine = ForwardBackwardEngine::new(&set, &config);

        let seq = FeatureSequence::new(arr2(&[[0.0]])).unwrap();
        let err = engine.analyze(&seq, &[0]).unwrap_err();
        assert!(matches!(err, HmmError::TooShort { len: 1, min: 2 }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_tight_beam_collapses_recoverably() {
        // A beam of zero width keeps only the single best state per frame;
        // with a no-skip two-state chain over four frames this starves the
        // lattice at some frame.
        let set = two_state_set();
        let config = TrainingConfig::default().with_beam(0.0);
        let engine = ForwardBackwardEngine::new(&set, &config);

        let seq =
            FeatureSequence::new(arr2(&[[2.5], [2.5], [2.5], [2.5], [2.5], [2.5]])).unwrap();
        match engine.analyze(&seq, &[0]) {
            Err(e) => assert!(e.is_recoverable()),
            // A surviving lattice is acceptable as long as posteriors hold
            Ok(lattice) => {
                let total: f64 = (0..lattice.chain().num_states())
                    .map(|g| lattice.gamma(0, g))
                    .sum();
                assert!(total <= 1.0 + 1e-6);
            }
        }
    }

    #[test]
    fn test_beam_prunes_far_states() {
        let set = two_state_set();
        // Wide beam: both states live in the middle of the sequence
        let wide = TrainingConfig::default().with_beam(1e6);
        let engine = ForwardBackwardEngine::new(&set, &wide);
        let seq = FeatureSequence::new(arr2(&[[0.0], [2.5], [5.0]])).unwrap();
        let lattice = engine.analyze(&seq, &[0]).unwrap();

        // Occupation exists for both states at the ambiguous frame
        assert!(lattice.gamma(1, 0) > 0.0);
        assert!(lattice.gamma(1, 1) > 0.0);
    }
}
