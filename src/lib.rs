//! Continuous-density hidden Markov models for sequence classification
//!
//! Trains and evaluates HMMs over time-indexed feature vectors (acoustic
//! frames or similar). Emissions are Gaussian mixtures with full or
//! diagonal covariance; training is embedded Baum-Welch reestimation with
//! beam pruning; decoding is Viterbi over left-right or ergodic
//! topologies. A joint linear-Gaussian factor extension couples each
//! state to a second synthesis parameter space and reconstructs synthesis
//! vectors from acoustic observations by closed-form MAP conditioning.
//!
//! # Quick start
//!
//! ```
//! use hmm_seq::data::{Corpus, FeatureSequence, Utterance};
//! use hmm_seq::models::{GaussianModel, HmmModel, HmmSet, MixtureModel};
//! use hmm_seq::train::EmbeddedReestimator;
//! use hmm_seq::TrainingConfig;
//! use ndarray::{arr2, array};
//!
//! // Two-state left-right model with unit-variance emissions
//! let states = vec![
//!     MixtureModel::single(GaussianModel::with_identity(array![0.0])),
//!     MixtureModel::single(GaussianModel::with_identity(array![5.0])),
//! ];
//! let model = HmmModel::left_right_no_skip("word", 0.5, states).unwrap();
//! let mut set = HmmSet::new(vec![model]).unwrap();
//!
//! // One training utterance spanning both states
//! let features = FeatureSequence::new(arr2(&[[0.1], [0.2], [4.9], [5.1]])).unwrap();
//! let corpus = Corpus::new(vec![Utterance::new(features.clone(), vec![0]).unwrap()]);
//!
//! let trainer = EmbeddedReestimator::new(TrainingConfig::default().with_max_iterations(3));
//! let report = trainer.train(&mut set, &corpus).unwrap();
//! assert!(report.final_log_likelihood().unwrap().is_finite());
//!
//! // Decode
//! let alignment = set.model(0).unwrap().viterbi(&features).unwrap();
//! assert_eq!(alignment.path.len(), 4);
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod math;
pub mod models;
pub mod train;

pub use config::TrainingConfig;
pub use error::{HmmError, Result};
