//! CSV load/save for feature sequences
//!
//! A sequence file is plain CSV without headers: one row per frame, one
//! column per feature dimension. A corpus directory holds sequence files
//! plus a `manifest.csv` mapping each file to its transcription.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array2;
use serde::Deserialize;

use crate::data::{Corpus, FeatureSequence, Utterance};

/// One manifest row: a sequence file and its space-separated model indices.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    file: String,
    transcription: String,
}

/// Load a feature sequence from a headerless CSV file.
pub fn load_sequence<P: AsRef<Path>>(path: P) -> Result<FeatureSequence> {
    let file = File::open(&path)
        .with_context(|| format!("Failed to open sequence file: {:?}", path.as_ref()))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut rows: Vec<f64> = Vec::new();
    let mut dim = 0usize;
    let mut frames = 0usize;

    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to read frame at line {line}"))?;
        if dim == 0 {
            dim = record.len();
        } else if record.len() != dim {
            anyhow::bail!(
                "frame at line {} has {} values, expected {}",
                line,
                record.len(),
                dim
            );
        }
        for field in record.iter() {
            let value: f64 = field
                .trim()
                .parse()
                .with_context(|| format!("Bad value {field:?} at line {line}"))?;
            rows.push(value);
        }
        frames += 1;
    }

    let data = Array2::from_shape_vec((frames, dim), rows)
        .context("Failed to assemble frame matrix")?;
    Ok(FeatureSequence::new(data)?)
}

/// Save a feature sequence to a headerless CSV file.
pub fn save_sequence<P: AsRef<Path>>(seq: &FeatureSequence, path: P) -> Result<()> {
    let file = File::create(&path)
        .with_context(|| format!("Failed to create sequence file: {:?}", path.as_ref()))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    for t in 0..seq.len() {
        let row: Vec<String> = seq.frame(t).iter().map(|v| v.to_string()).collect();
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Load a training corpus from a directory containing `manifest.csv`.
///
/// Each manifest row names a sequence file (relative to the directory) and
/// a transcription of space-separated logical model indices.
pub fn load_corpus<P: AsRef<Path>>(dir: P) -> Result<Corpus> {
    let dir = dir.as_ref();
    let manifest_path = dir.join("manifest.csv");
    let file = File::open(&manifest_path)
        .with_context(|| format!("Failed to open corpus manifest: {manifest_path:?}"))?;

    let mut reader = csv::Reader::from_reader(file);
    let mut utterances = Vec::new();

    for result in reader.deserialize() {
        let entry: ManifestEntry = result.context("Failed to parse manifest row")?;
        let features = load_sequence(dir.join(&entry.file))?;
        let transcription: Vec<usize> = entry
            .transcription
            .split_whitespace()
            .map(|tok| {
                tok.parse::<usize>()
                    .with_context(|| format!("Bad model index {tok:?} in {}", entry.file))
            })
            .collect::<Result<_>>()?;
        utterances.push(Utterance::new(features, transcription)?);
    }

    Ok(Corpus::new(utterances))
}
