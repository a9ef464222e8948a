//! Feature sequence and corpus types

use ndarray::{Array2, ArrayView1};

use crate::error::{HmmError, Result};

/// An ordered sequence of fixed-dimension feature vectors (frames).
///
/// Rows are frames, columns are feature dimensions. Immutable after
/// construction; all frames share one dimensionality and the sequence is
/// never empty.
#[derive(Debug, Clone)]
pub struct FeatureSequence {
    data: Array2<f64>,
}

impl FeatureSequence {
    /// Wrap a frame matrix, validating the sequence invariants.
    pub fn new(data: Array2<f64>) -> Result<Self> {
        if data.nrows() == 0 {
            return Err(HmmError::EmptySequence);
        }
        if data.ncols() == 0 {
            return Err(HmmError::DimensionMismatch(
                "frames must have at least one dimension".into(),
            ));
        }
        Ok(Self { data })
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    /// Never true for a constructed sequence; present for completeness.
    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    /// Feature dimensionality.
    pub fn dim(&self) -> usize {
        self.data.ncols()
    }

    /// Borrow frame `t`.
    pub fn frame(&self, t: usize) -> ArrayView1<'_, f64> {
        self.data.row(t)
    }

    /// Borrow the full frame matrix.
    pub fn frames(&self) -> &Array2<f64> {
        &self.data
    }
}

/// One training utterance: a feature sequence plus its transcription,
/// the ordered list of logical model indices it traverses.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub features: FeatureSequence,
    pub transcription: Vec<usize>,
}

impl Utterance {
    /// Create an utterance; the transcription must not be empty.
    pub fn new(features: FeatureSequence, transcription: Vec<usize>) -> Result<Self> {
        if transcription.is_empty() {
            return Err(HmmError::DimensionMismatch(
                "utterance transcription is empty".into(),
            ));
        }
        Ok(Self {
            features,
            transcription,
        })
    }
}

/// An ordered collection of utterances forming one training corpus.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub utterances: Vec<Utterance>,
}

impl Corpus {
    /// Create a corpus from utterances.
    pub fn new(utterances: Vec<Utterance>) -> Self {
        Self { utterances }
    }

    /// Number of utterances.
    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    /// Whether the corpus has no utterances.
    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    /// Total number of frames across all utterances.
    pub fn total_frames(&self) -> usize {
        self.utterances.iter().map(|u| u.features.len()).sum()
    }

    /// Feature dimensionality, taken from the first utterance.
    pub fn dim(&self) -> Option<usize> {
        self.utterances.first().map(|u| u.features.dim())
    }
}

/// A time-aligned pair of acoustic and synthesis-space sequences for the
/// joint linear-factor model.
#[derive(Debug, Clone)]
pub struct PairedUtterance {
    pub acoustic: FeatureSequence,
    pub synthesis: FeatureSequence,
    pub transcription: Vec<usize>,
}

impl PairedUtterance {
    /// Pair two sequences; mismatched lengths are a setup error, rejected
    /// before any accumulation can begin.
    pub fn new(
        acoustic: FeatureSequence,
        synthesis: FeatureSequence,
        transcription: Vec<usize>,
    ) -> Result<Self> {
        if acoustic.len() != synthesis.len() {
            return Err(HmmError::LengthMismatch {
                acoustic: acoustic.len(),
                synthesis: synthesis.len(),
            });
        }
        if transcription.is_empty() {
            return Err(HmmError::DimensionMismatch(
                "utterance transcription is empty".into(),
            ));
        }
        Ok(Self {
            acoustic,
            synthesis,
            transcription,
        })
    }

    /// Number of frames (shared by both sides).
    pub fn len(&self) -> usize {
        self.acoustic.len()
    }

    /// Whether the pair holds no frames; never true once constructed.
    pub fn is_empty(&self) -> bool {
        self.acoustic.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_sequence_invariants() {
        let seq = FeatureSequence::new(arr2(&[[1.0, 2.0], [3.0, 4.0]])).unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.dim(), 2);
        assert_eq!(seq.frame(1)[0], 3.0);
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let empty: Array2<f64> = Array2::zeros((0, 3));
        assert!(matches!(
            FeatureSequence::new(empty),
            Err(HmmError::EmptySequence)
        ));
    }

    #[test]
    fn test_paired_length_mismatch_is_fatal() {
        let a = FeatureSequence::new(arr2(&[[1.0], [2.0], [3.0]])).unwrap();
        let s = FeatureSequence::new(arr2(&[[1.0], [2.0]])).unwrap();
        let err = PairedUtterance::new(a, s, vec![0]).unwrap_err();
        assert!(matches!(
            err,
            HmmError::LengthMismatch {
                acoustic: 3,
                synthesis: 2
            }
        ));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_corpus_totals() {
        let u1 = Utterance::new(
            FeatureSequence::new(arr2(&[[1.0], [2.0]])).unwrap(),
            vec![0],
        )
        .unwrap();
        let u2 = Utterance::new(FeatureSequence::new(arr2(&[[3.0]])).unwrap(), vec![1]).unwrap();
        let corpus = Corpus::new(vec![u1, u2]);
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.total_frames(), 3);
        assert_eq!(corpus.dim(), Some(1));
    }
}
