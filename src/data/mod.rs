//! Feature sequences and corpus handling
//!
//! Provides the frame-sequence types consumed by training and decoding,
//! and CSV-based load/save for them.

mod io;
mod sequence;

pub use io::{load_corpus, load_sequence, save_sequence};
pub use sequence::{Corpus, FeatureSequence, PairedUtterance, Utterance};
