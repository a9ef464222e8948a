//! Streaming sufficient-statistic accumulators
//!
//! Every accumulator collects gamma-weighted sums over one corpus pass and
//! converts them into a parameter exactly once. `reestimate` returns a
//! success flag; on failure the target parameter is left untouched and the
//! caller keeps the previous value. Cells are held in an arena keyed by
//! explicit (model, state[, mixture]) indices.

use ndarray::{Array1, Array2, ArrayView1};
use tracing::warn;

use crate::math::linalg::solve;
use crate::models::HmmSet;

/// First-order gamma-weighted sums for a mean vector.
#[derive(Debug, Clone)]
pub struct MeanAccumulator {
    sum: Array1<f64>,
    occupation: f64,
}

impl MeanAccumulator {
    pub fn new(dim: usize) -> Self {
        Self {
            sum: Array1::zeros(dim),
            occupation: 0.0,
        }
    }

    /// Add one gamma-weighted observation.
    pub fn update(&mut self, weight: f64, x: ArrayView1<'_, f64>) {
        for (s, &v) in self.sum.iter_mut().zip(x.iter()) {
            *s += weight * v;
        }
        self.occupation += weight;
    }

    /// Total occupation weight collected so far.
    pub fn occupation(&self) -> f64 {
        self.occupation
    }

    /// Occupation-normalized accumulated mean, if any weight was seen.
    pub fn accumulated_mean(&self) -> Option<Array1<f64>> {
        if self.occupation > 0.0 {
            Some(&self.sum / self.occupation)
        } else {
            None
        }
    }

    /// Write the reestimated mean into `mean`.
    ///
    /// Fails on zero total occupation, leaving `mean` untouched.
    pub fn reestimate(&self, mean: &mut Array1<f64>) -> bool {
        match self.accumulated_mean() {
            Some(m) => {
                *mean = m;
                true
            }
            None => {
                warn!("mean reestimation skipped: zero occupation");
                false
            }
        }
    }

    pub fn reset(&mut self) {
        self.sum.fill(0.0);
        self.occupation = 0.0;
    }
}

/// First- and second-order sums for a full covariance matrix.
#[derive(Debug, Clone)]
pub struct FullCovarianceAccumulator {
    sum: Array1<f64>,
    sq_sum: Array2<f64>,
    occupation: f64,
}

impl FullCovarianceAccumulator {
    pub fn new(dim: usize) -> Self {
        Self {
            sum: Array1::zeros(dim),
            sq_sum: Array2::zeros((dim, dim)),
            occupation: 0.0,
        }
    }

    pub fn update(&mut self, weight: f64, x: ArrayView1<'_, f64>) {
        let d = self.sum.len();
        for i in 0..d {
            self.sum[i] += weight * x[i];
            for j in 0..d {
                self.sq_sum[[i, j]] += weight * x[i] * x[j];
            }
        }
        self.occupation += weight;
    }

    pub fn occupation(&self) -> f64 {
        self.occupation
    }

    /// Write the reestimated covariance E[xxᵀ] − E[x]E[x]ᵀ into `covariance`.
    ///
    /// Variances are floored at `floor`; if any variance still falls below
    /// `abs_min` the whole update is rejected and the previous matrix kept.
    /// This protects against degenerate near-zero-variance states.
    pub fn reestimate(&self, covariance: &mut Array2<f64>, floor: f64, abs_min: f64) -> bool {
        if self.occupation <= 0.0 {
            warn!("covariance reestimation skipped: zero occupation");
            return false;
        }

        let d = self.sum.len();
        let mut cov = Array2::zeros((d, d));
        for i in 0..d {
            let ei = self.sum[i] / self.occupation;
            for j in 0..d {
                let ej = self.sum[j] / self.occupation;
                cov[[i, j]] = self.sq_sum[[i, j]] / self.occupation - ei * ej;
            }
        }

        for i in 0..d {
            if cov[[i, i]] < floor {
                cov[[i, i]] = floor;
            }
            if cov[[i, i]] < abs_min {
                warn!(
                    "covariance update rejected: variance {:.3e} below absolute minimum {:.3e}",
                    cov[[i, i]],
                    abs_min
                );
                return false;
            }
        }

        *covariance = cov;
        true
    }

    pub fn reset(&mut self) {
        self.sum.fill(0.0);
        self.sq_sum.fill(0.0);
        self.occupation = 0.0;
    }
}

/// Cross statistics between an acoustic vector y and a synthesis vector x
/// of different dimensionalities.
#[derive(Debug, Clone)]
pub struct CrossCovarianceAccumulator {
    yx_sum: Array2<f64>,
    xx_sum: Array2<f64>,
    y_sum: Array1<f64>,
    x_sum: Array1<f64>,
    occupation: f64,
}

impl CrossCovarianceAccumulator {
    pub fn new(y_dim: usize, x_dim: usize) -> Self {
        Self {
            yx_sum: Array2::zeros((y_dim, x_dim)),
            xx_sum: Array2::zeros((x_dim, x_dim)),
            y_sum: Array1::zeros(y_dim),
            x_sum: Array1::zeros(x_dim),
            occupation: 0.0,
        }
    }

    pub fn update(&mut self, weight: f64, y: ArrayView1<'_, f64>, x: ArrayView1<'_, f64>) {
        let dy = self.y_sum.len();
        let dx = self.x_sum.len();
        for i in 0..dy {
            self.y_sum[i] += weight * y[i];
            for j in 0..dx {
                self.yx_sum[[i, j]] += weight * y[i] * x[j];
            }
        }
        for i in 0..dx {
            self.x_sum[i] += weight * x[i];
            for j in 0..dx {
                self.xx_sum[[i, j]] += weight * x[i] * x[j];
            }
        }
        self.occupation += weight;
    }

    pub fn occupation(&self) -> f64 {
        self.occupation
    }

    pub fn mean_y(&self) -> Option<Array1<f64>> {
        if self.occupation > 0.0 {
            Some(&self.y_sum / self.occupation)
        } else {
            None
        }
    }

    pub fn mean_x(&self) -> Option<Array1<f64>> {
        if self.occupation > 0.0 {
            Some(&self.x_sum / self.occupation)
        } else {
            None
        }
    }

    /// Write the reestimated factor-loading matrix into `loading`:
    /// the cross-covariance divided by the synthesis-space covariance,
    /// i.e. closed-form linear regression A = Cov(y,x)·Cov(x,x)⁻¹.
    ///
    /// Fails on zero occupation or a near-singular synthesis covariance.
    pub fn reestimate_loading(&self, loading: &mut Array2<f64>) -> bool {
        if self.occupation <= 0.0 {
            warn!("loading reestimation skipped: zero occupation");
            return false;
        }

        let dy = self.y_sum.len();
        let dx = self.x_sum.len();
        let mut c_yx = Array2::zeros((dy, dx));
        let mut c_xx = Array2::zeros((dx, dx));
        for i in 0..dy {
            let ey = self.y_sum[i] / self.occupation;
            for j in 0..dx {
                let ex = self.x_sum[j] / self.occupation;
                c_yx[[i, j]] = self.yx_sum[[i, j]] / self.occupation - ey * ex;
            }
        }
        for i in 0..dx {
            let ei = self.x_sum[i] / self.occupation;
            for j in 0..dx {
                let ej = self.x_sum[j] / self.occupation;
                c_xx[[i, j]] = self.xx_sum[[i, j]] / self.occupation - ei * ej;
            }
        }

        // Row r of A solves Cxx·aᵣ = Cyx[r,:] (Cxx is symmetric).
        let mut a = Array2::zeros((dy, dx));
        for r in 0..dy {
            let rhs = c_yx.row(r).to_owned();
            match solve(&c_xx, &rhs) {
                Ok(row) => a.row_mut(r).assign(&row),
                Err(e) => {
                    warn!("loading reestimation rejected: {e}");
                    return false;
                }
            }
        }

        *loading = a;
        true
    }

    pub fn reset(&mut self) {
        self.yx_sum.fill(0.0);
        self.xx_sum.fill(0.0);
        self.y_sum.fill(0.0);
        self.x_sum.fill(0.0);
        self.occupation = 0.0;
    }
}

/// First moments of both spaces, for the regression bias.
#[derive(Debug, Clone)]
pub struct BiasAccumulator {
    y_sum: Array1<f64>,
    x_sum: Array1<f64>,
    occupation: f64,
}

impl BiasAccumulator {
    pub fn new(y_dim: usize, x_dim: usize) -> Self {
        Self {
            y_sum: Array1::zeros(y_dim),
            x_sum: Array1::zeros(x_dim),
            occupation: 0.0,
        }
    }

    pub fn update(&mut self, weight: f64, y: ArrayView1<'_, f64>, x: ArrayView1<'_, f64>) {
        for (s, &v) in self.y_sum.iter_mut().zip(y.iter()) {
            *s += weight * v;
        }
        for (s, &v) in self.x_sum.iter_mut().zip(x.iter()) {
            *s += weight * v;
        }
        self.occupation += weight;
    }

    pub fn occupation(&self) -> f64 {
        self.occupation
    }

    /// Write bias = E[y] − A·E[x] into `bias`, given the already
    /// reestimated loading matrix.
    pub fn reestimate(&self, bias: &mut Array1<f64>, loading: &Array2<f64>) -> bool {
        if self.occupation <= 0.0 {
            warn!("bias reestimation skipped: zero occupation");
            return false;
        }
        let ey = &self.y_sum / self.occupation;
        let ex = &self.x_sum / self.occupation;
        *bias = &ey - &loading.dot(&ex);
        true
    }

    pub fn reset(&mut self) {
        self.y_sum.fill(0.0);
        self.x_sum.fill(0.0);
        self.occupation = 0.0;
    }
}

/// Gamma-weighted transition counts for one model, (S+2)×(S+2).
#[derive(Debug, Clone)]
pub struct TransitionAccumulator {
    counts: Array2<f64>,
}

impl TransitionAccumulator {
    pub fn new(num_states: usize) -> Self {
        let n = num_states + 2;
        Self {
            counts: Array2::zeros((n, n)),
        }
    }

    pub fn add(&mut self, from: usize, to: usize, weight: f64) {
        self.counts[[from, to]] += weight;
    }

    /// Row-normalize the counts into `transitions` (probability domain).
    ///
    /// Rows with zero occupation keep their previous values. Fails only
    /// when no row collected any occupation at all.
    pub fn reestimate(&self, transitions: &mut Array2<f64>) -> bool {
        let n = self.counts.nrows();
        let mut any = false;
        for i in 0..n {
            let row_sum: f64 = self.counts.row(i).sum();
            if row_sum <= 0.0 {
                continue;
            }
            any = true;
            for j in 0..n {
                transitions[[i, j]] = self.counts[[i, j]] / row_sum;
            }
        }
        if !any {
            warn!("transition reestimation skipped: zero occupation in every row");
        }
        any
    }

    pub fn reset(&mut self) {
        self.counts.fill(0.0);
    }
}

/// Accumulator cell for one mixture component.
#[derive(Debug, Clone)]
pub struct MixtureCell {
    pub mean: MeanAccumulator,
    pub covariance: FullCovarianceAccumulator,
}

/// Accumulator cell for one emitting state.
#[derive(Debug, Clone)]
pub struct StateCell {
    pub mixtures: Vec<MixtureCell>,
    /// Total state-level occupation, the denominator for mixture weights.
    pub occupation: f64,
}

/// Accumulator cells for one physical model.
#[derive(Debug, Clone)]
pub struct ModelCell {
    pub states: Vec<StateCell>,
    pub transitions: TransitionAccumulator,
}

/// Arena of accumulator cells indexed by (physical model, state, mixture).
///
/// Explicit integer keying keeps reset trivial and makes the reduction of
/// per-utterance partial sums a plain elementwise addition.
#[derive(Debug, Clone)]
pub struct AccumulatorArena {
    pub models: Vec<ModelCell>,
}

impl AccumulatorArena {
    /// Build an arena shaped after the physical models of a set.
    pub fn for_set(set: &HmmSet) -> Self {
        let dim = set.dim();
        let models = (0..set.num_physical())
            .map(|p| {
                let model = set.physical_model(p);
                let states = model
                    .states()
                    .iter()
                    .map(|mix| StateCell {
                        mixtures: (0..mix.num_components())
                            .map(|_| MixtureCell {
                                mean: MeanAccumulator::new(dim),
                                covariance: FullCovarianceAccumulator::new(dim),
                            })
                            .collect(),
                        occupation: 0.0,
                    })
                    .collect();
                ModelCell {
                    states,
                    transitions: TransitionAccumulator::new(model.num_states()),
                }
            })
            .collect();
        Self { models }
    }

    /// Zero every cell for the next pass.
    pub fn reset(&mut self) {
        for model in &mut self.models {
            model.transitions.reset();
            for state in &mut model.states {
                state.occupation = 0.0;
                for mixture in &mut state.mixtures {
                    mixture.mean.reset();
                    mixture.covariance.reset();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Fixture vectors shared by the mean and covariance tests.
    fn fixture() -> Vec<Array1<f64>> {
        vec![array![5.0, 7.0], array![1.0, 1.0], array![3.0, 3.0]]
    }

    #[test]
    fn test_mean_accumulator_fixture() {
        let mut acc = MeanAccumulator::new(2);
        for x in fixture() {
            acc.update(1.0, x.view());
        }

        let m = acc.accumulated_mean().unwrap();
        assert!((m[0] - 3.0).abs() < 1e-12);
        assert!((m[1] - 11.0 / 3.0).abs() < 1e-12);

        let mut mean = Array1::zeros(2);
        assert!(acc.reestimate(&mut mean));
        assert!((mean[0] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_full_covariance_fixture() {
        let mut acc = FullCovarianceAccumulator::new(2);
        for x in fixture() {
            acc.update(1.0, x.view());
        }

        let mut cov = Array2::zeros((2, 2));
        assert!(acc.reestimate(&mut cov, 0.0, 0.0));

        let expected = array![[2.667, 4.0], [4.0, 6.222]];
        for i in 0..2 {
            for j in 0..2 {
                assert!(
                    (cov[[i, j]] - expected[[i, j]]).abs() < 1e-3,
                    "cov[{i}][{j}] = {} expected {}",
                    cov[[i, j]],
                    expected[[i, j]]
                );
            }
        }
    }

    #[test]
    fn test_zero_weight_reestimate_leaves_parameters_untouched() {
        let mut mean_acc = MeanAccumulator::new(2);
        let mut cov_acc = FullCovarianceAccumulator::new(2);
        let mut cross_acc = CrossCovarianceAccumulator::new(2, 2);
        let mut bias_acc = BiasAccumulator::new(2, 2);
        let x = array![1.0, 2.0];
        mean_acc.update(0.0, x.view());
        cov_acc.update(0.0, x.view());
        cross_acc.update(0.0, x.view(), x.view());
        bias_acc.update(0.0, x.view(), x.view());

        let mut mean = array![9.0, 9.0];
        let mut cov = array![[9.0, 0.0], [0.0, 9.0]];
        let mut loading = array![[9.0, 0.0], [0.0, 9.0]];
        let mut bias = array![9.0, 9.0];

        assert!(!mean_acc.reestimate(&mut mean));
        assert!(!cov_acc.reestimate(&mut cov, 0.0, 0.0));
        assert!(!cross_acc.reestimate_loading(&mut loading));
        assert!(!bias_acc.reestimate(&mut bias, &loading));

        assert_eq!(mean, array![9.0, 9.0]);
        assert_eq!(cov, array![[9.0, 0.0], [0.0, 9.0]]);
        assert_eq!(loading, array![[9.0, 0.0], [0.0, 9.0]]);
        assert_eq!(bias, array![9.0, 9.0]);
    }

    #[test]
    fn test_covariance_floor_and_rejection() {
        let mut acc = FullCovarianceAccumulator::new(1);
        // Two identical points: zero variance
        acc.update(1.0, array![2.0].view());
        acc.update(1.0, array![2.0].view());

        // Floored up to the floor value
        let mut cov = array![[5.0]];
        assert!(acc.reestimate(&mut cov, 0.01, 0.001));
        assert!((cov[[0, 0]] - 0.01).abs() < 1e-12);

        // Floor below the absolute minimum: whole update rejected
        let mut cov = array![[5.0]];
        assert!(!acc.reestimate(&mut cov, 1e-12, 1e-6));
        assert_eq!(cov[[0, 0]], 5.0);
    }

    #[test]
    fn test_cross_covariance_recovers_linear_map() {
        // y = A x + b with known A, b; regression must recover A.
        let a_true = array![[2.0, 0.5], [-1.0, 1.5]];
        let b_true = array![1.0, -2.0];

        let mut cross = CrossCovarianceAccumulator::new(2, 2);
        let mut bias = BiasAccumulator::new(2, 2);
        let xs = [
            array![0.0, 0.0],
            array![1.0, 0.0],
            array![0.0, 1.0],
            array![1.0, 1.0],
            array![2.0, -1.0],
        ];
        for x in &xs {
            let y = a_true.dot(x) + &b_true;
            cross.update(1.0, y.view(), x.view());
            bias.update(1.0, y.view(), x.view());
        }

        let mut loading = Array2::zeros((2, 2));
        assert!(cross.reestimate_loading(&mut loading));
        for i in 0..2 {
            for j in 0..2 {
                assert!((loading[[i, j]] - a_true[[i, j]]).abs() < 1e-9);
            }
        }

        let mut b = Array1::zeros(2);
        assert!(bias.reestimate(&mut b, &loading));
        for i in 0..2 {
            assert!((b[i] - b_true[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_cross_covariance_singular_synthesis_rejected() {
        // x never varies in the second coordinate: Cov(x,x) singular.
        let mut cross = CrossCovarianceAccumulator::new(1, 2);
        for t in 0..5 {
            let x = array![t as f64, 1.0];
            let y = array![t as f64 * 2.0];
            cross.update(1.0, y.view(), x.view());
        }
        let mut loading = array![[7.0, 7.0]];
        assert!(!cross.reestimate_loading(&mut loading));
        assert_eq!(loading, array![[7.0, 7.0]]);
    }

    #[test]
    fn test_transition_rows_normalized_and_retained() {
        let mut acc = TransitionAccumulator::new(2);
        acc.add(1, 1, 3.0);
        acc.add(1, 2, 1.0);
        // Row 2 gets no occupation

        let mut transitions = array![
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.5, 0.5, 0.0],
            [0.0, 0.0, 0.5, 0.5],
            [0.0, 0.0, 0.0, 1.0],
        ];
        assert!(acc.reestimate(&mut transitions));

        assert!((transitions[[1, 1]] - 0.75).abs() < 1e-12);
        assert!((transitions[[1, 2]] - 0.25).abs() < 1e-12);
        // Unoccupied row keeps its previous parameters
        assert!((transitions[[2, 2]] - 0.5).abs() < 1e-12);
        assert!((transitions[[2, 3]] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_arena_reset_zeroes_everything() {
        use crate::models::{GaussianModel, HmmModel, MixtureModel};

        let model = HmmModel::left_right_no_skip(
            "m",
            0.5,
            vec![MixtureModel::single(GaussianModel::with_identity(
                array![0.0],
            ))],
        )
        .unwrap();
        let set = HmmSet::new(vec![model]).unwrap();

        let mut arena = AccumulatorArena::for_set(&set);
        arena.models[0].states[0].mixtures[0]
            .mean
            .update(1.0, array![2.0].view());
        arena.models[0].states[0].occupation = 1.0;
        arena.models[0].transitions.add(1, 1, 1.0);

        arena.reset();
        assert_eq!(arena.models[0].states[0].occupation, 0.0);
        assert_eq!(arena.models[0].states[0].mixtures[0].mean.occupation(), 0.0);
    }
}
