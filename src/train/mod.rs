//! Training: accumulators, forward-backward analysis, embedded
//! Baum-Welch reestimation and the joint linear-factor extension.

pub mod accumulators;
mod embedded;
mod factor;
mod forward_backward;

pub use accumulators::{
    AccumulatorArena, BiasAccumulator, CrossCovarianceAccumulator, FullCovarianceAccumulator,
    MeanAccumulator, TransitionAccumulator,
};
pub use embedded::{CancelToken, EmbeddedReestimator, PassReport, TrainingReport};
pub use factor::{
    reconstruct_synthesis, FactorCell, FactorReport, FactorTable, LinearFactorReestimator,
};
pub use forward_backward::{compose, CompositeChain, CompositeState, ForwardBackwardEngine, Lattice};
