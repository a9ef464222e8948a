//! Emission and sequence models
//!
//! Gaussian and mixture emission densities, the HMM itself with Viterbi
//! decoding and forward scoring, and model-set persistence.

mod gaussian;
mod hmm;
mod mixture;
mod persist;

pub use gaussian::{Covariance, GaussianModel};
pub use hmm::{
    decode_run_lengths, encode_run_lengths, Alignment, HmmModel, HmmSet, Topology,
};
pub use mixture::{MixtureComponent, MixtureModel};
pub use persist::{load, save};
