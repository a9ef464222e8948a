//! Error types for training and decoding

use thiserror::Error;

/// Errors produced by model construction, decoding and training.
#[derive(Error, Debug)]
pub enum HmmError {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("transition row {row} sums to {sum}, expected ~1.0")]
    InvalidTransitions { row: usize, sum: f64 },

    #[error("feature sequence is empty")]
    EmptySequence,

    #[error("model index {index} out of range ({len} models)")]
    ModelIndexOutOfRange { index: usize, len: usize },

    #[error("utterance has {len} frames but the topology needs at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("pruning beam collapsed at frame {frame}: no active states")]
    BeamCollapse { frame: usize },

    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    #[error("acoustic and synthesis sequences differ in length: {acoustic} vs {synthesis}")]
    LengthMismatch { acoustic: usize, synthesis: usize },

    #[error("no decodable path through the model")]
    NoPath,

    #[error("no factor cell estimated for model {model} state {state}")]
    MissingFactorCell { model: usize, state: usize },

    #[error("model file error: {0}")]
    Persist(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HmmError {
    /// Whether this failure affects a single utterance only.
    ///
    /// Recoverable errors are counted and skipped during a corpus pass;
    /// everything else aborts the pass.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HmmError::TooShort { .. } | HmmError::BeamCollapse { .. }
        )
    }
}

/// Result type for library operations
pub type Result<T> = std::result::Result<T, HmmError>;
