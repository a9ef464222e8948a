//! Mixture-of-Gaussians emission model for one HMM state

use ndarray::ArrayView1;
use tracing::debug;

use crate::error::{HmmError, Result};
use crate::math::logprob::{log_add, safe_ln, LOG_ZERO};
use crate::models::gaussian::GaussianModel;

/// One weighted mixture component.
#[derive(Debug, Clone)]
pub struct MixtureComponent {
    pub weight: f64,
    pub gaussian: GaussianModel,
}

/// Weighted collection of Gaussians forming one state's emission density.
///
/// Weights are non-negative and conceptually sum to one; this is not hard
/// enforced because pruning and reestimation both perturb the sum before
/// renormalizing.
#[derive(Debug, Clone)]
pub struct MixtureModel {
    components: Vec<MixtureComponent>,
}

impl MixtureModel {
    /// Build a mixture from (weight, gaussian) pairs.
    pub fn new(components: Vec<MixtureComponent>) -> Result<Self> {
        if components.is_empty() {
            return Err(HmmError::DimensionMismatch(
                "mixture needs at least one component".into(),
            ));
        }
        let dim = components[0].gaussian.dim();
        for (m, c) in components.iter().enumerate() {
            if c.gaussian.dim() != dim {
                return Err(HmmError::DimensionMismatch(format!(
                    "component {m} has dim {}, expected {dim}",
                    c.gaussian.dim()
                )));
            }
            if c.weight < 0.0 {
                return Err(HmmError::DimensionMismatch(format!(
                    "component {m} has negative weight {}",
                    c.weight
                )));
            }
        }
        Ok(Self { components })
    }

    /// Single-Gaussian mixture with weight one.
    pub fn single(gaussian: GaussianModel) -> Self {
        Self {
            components: vec![MixtureComponent {
                weight: 1.0,
                gaussian,
            }],
        }
    }

    /// Number of components.
    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Feature dimensionality.
    pub fn dim(&self) -> usize {
        self.components[0].gaussian.dim()
    }

    /// Borrow the components.
    pub fn components(&self) -> &[MixtureComponent] {
        &self.components
    }

    /// Mutable access for reestimation.
    pub fn components_mut(&mut self) -> &mut [MixtureComponent] {
        &mut self.components
    }

    /// Log-density: log-sum-exp over components of
    /// component log-density + log weight.
    pub fn log_density(&self, x: ArrayView1<'_, f64>) -> f64 {
        let mut acc = LOG_ZERO;
        for c in &self.components {
            acc = log_add(acc, safe_ln(c.weight) + c.gaussian.log_density(x));
        }
        acc
    }

    /// Per-component log-densities including the weight term.
    ///
    /// Used by the trainer to split state-level occupation across mixture
    /// components.
    pub fn component_log_densities(&self, x: ArrayView1<'_, f64>) -> Vec<f64> {
        self.components
            .iter()
            .map(|c| safe_ln(c.weight) + c.gaussian.log_density(x))
            .collect()
    }

    /// Discard components whose weight has fallen below `threshold` and
    /// renormalize the rest.
    ///
    /// This is a one-way simplification: the pruned components are gone for
    /// good. The heaviest component is always kept, so the mixture never
    /// becomes empty.
    pub fn prune_negligible(&mut self, threshold: f64) {
        let heaviest = self
            .components
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.weight.partial_cmp(&b.weight).unwrap())
            .map(|(i, _)| i)
            .unwrap_or(0);

        let before = self.components.len();
        let mut idx = 0;
        self.components.retain(|c| {
            let keep = c.weight >= threshold || idx == heaviest;
            idx += 1;
            keep
        });

        let pruned = before - self.components.len();
        if pruned > 0 {
            debug!("pruned {pruned} negligible mixture component(s)");
            let total: f64 = self.components.iter().map(|c| c.weight).sum();
            if total > 0.0 {
                for c in &mut self.components {
                    c.weight /= total;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_component_mixture() -> MixtureModel {
        MixtureModel::new(vec![
            MixtureComponent {
                weight: 0.75,
                gaussian: GaussianModel::with_identity(array![0.0]),
            },
            MixtureComponent {
                weight: 0.25,
                gaussian: GaussianModel::with_identity(array![4.0]),
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_log_density_matches_hand_sum() {
        let mix = two_component_mixture();
        let x = array![1.0];

        let g0 = GaussianModel::with_identity(array![0.0]).log_density(x.view());
        let g1 = GaussianModel::with_identity(array![4.0]).log_density(x.view());
        let expected = (0.75 * g0.exp() + 0.25 * g1.exp()).ln();

        assert!((mix.log_density(x.view()) - expected).abs() < 1e-10);
    }

    #[test]
    fn test_single_component_equals_gaussian() {
        let g = GaussianModel::with_identity(array![2.0, -1.0]);
        let mix = MixtureModel::single(g.clone());
        let x = array![0.5, 0.5];
        assert!((mix.log_density(x.view()) - g.log_density(x.view())).abs() < 1e-12);
    }

    #[test]
    fn test_prune_negligible_is_one_way() {
        let mut mix = MixtureModel::new(vec![
            MixtureComponent {
                weight: 0.999,
                gaussian: GaussianModel::with_identity(array![0.0]),
            },
            MixtureComponent {
                weight: 0.001,
                gaussian: GaussianModel::with_identity(array![10.0]),
            },
        ])
        .unwrap();

        mix.prune_negligible(0.01);
        assert_eq!(mix.num_components(), 1);
        assert!((mix.components()[0].weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_prune_keeps_heaviest_component() {
        let mut mix = two_component_mixture();
        mix.prune_negligible(2.0);
        assert_eq!(mix.num_components(), 1);
        assert!((mix.components()[0].gaussian.mean()[0] - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_mixture_rejected() {
        assert!(MixtureModel::new(vec![]).is_err());
    }
}
