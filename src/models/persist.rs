//! Model set persistence
//!
//! Models are stored as a JSON blob, optionally gzip-compressed, with every
//! numeric parameter held as 32-bit floating point. Loading and re-saving a
//! file reproduces the stored parameters bit-for-bit at that precision.
//! Compression is detected on load from the gzip magic bytes.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{HmmError, Result};
use crate::models::gaussian::{Covariance, GaussianModel};
use crate::models::hmm::{HmmModel, HmmSet};
use crate::models::mixture::{MixtureComponent, MixtureModel};

const FORMAT_VERSION: u32 = 1;

/// Gzip magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Debug, Serialize, Deserialize)]
enum CovarianceRecord {
    Full { dim: usize, data: Vec<f32> },
    Diagonal { data: Vec<f32> },
}

#[derive(Debug, Serialize, Deserialize)]
struct GaussianRecord {
    mean: Vec<f32>,
    covariance: CovarianceRecord,
}

#[derive(Debug, Serialize, Deserialize)]
struct ComponentRecord {
    weight: f32,
    gaussian: GaussianRecord,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelRecord {
    name: String,
    num_states: usize,
    /// (S+2)² row-major transition probabilities.
    transitions: Vec<f32>,
    states: Vec<Vec<ComponentRecord>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SetRecord {
    version: u32,
    mapping: Vec<usize>,
    models: Vec<ModelRecord>,
}

fn gaussian_to_record(g: &GaussianModel) -> GaussianRecord {
    let covariance = match g.covariance() {
        Covariance::Full(m) => CovarianceRecord::Full {
            dim: m.nrows(),
            data: m.iter().map(|&v| v as f32).collect(),
        },
        Covariance::Diagonal(v) => CovarianceRecord::Diagonal {
            data: v.iter().map(|&x| x as f32).collect(),
        },
    };
    GaussianRecord {
        mean: g.mean().iter().map(|&v| v as f32).collect(),
        covariance,
    }
}

fn gaussian_from_record(r: &GaussianRecord) -> Result<GaussianModel> {
    let mean = Array1::from_iter(r.mean.iter().map(|&v| v as f64));
    let covariance = match &r.covariance {
        CovarianceRecord::Full { dim, data } => {
            let m = Array2::from_shape_vec((*dim, *dim), data.iter().map(|&v| v as f64).collect())
                .map_err(|e| HmmError::Persist(format!("bad covariance shape: {e}")))?;
            Covariance::Full(m)
        }
        CovarianceRecord::Diagonal { data } => {
            Covariance::Diagonal(Array1::from_iter(data.iter().map(|&v| v as f64)))
        }
    };
    GaussianModel::new(mean, covariance)
}

fn model_to_record(m: &HmmModel) -> ModelRecord {
    let transitions = m
        .log_transitions()
        .iter()
        .map(|&v| v.exp() as f32)
        .collect();
    let states = m
        .states()
        .iter()
        .map(|mix| {
            mix.components()
                .iter()
                .map(|c| ComponentRecord {
                    weight: c.weight as f32,
                    gaussian: gaussian_to_record(&c.gaussian),
                })
                .collect()
        })
        .collect();
    ModelRecord {
        name: m.name().to_string(),
        num_states: m.num_states(),
        transitions,
        states,
    }
}

fn model_from_record(r: &ModelRecord) -> Result<HmmModel> {
    let n = r.num_states + 2;
    if r.transitions.len() != n * n {
        return Err(HmmError::Persist(format!(
            "model {} stores {} transition entries, expected {}",
            r.name,
            r.transitions.len(),
            n * n
        )));
    }
    let transitions =
        Array2::from_shape_vec((n, n), r.transitions.iter().map(|&v| v as f64).collect())
            .map_err(|e| HmmError::Persist(format!("bad transition shape: {e}")))?;

    let mut states = Vec::with_capacity(r.states.len());
    for comps in &r.states {
        let components = comps
            .iter()
            .map(|c| {
                Ok(MixtureComponent {
                    weight: c.weight as f64,
                    gaussian: gaussian_from_record(&c.gaussian)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        states.push(MixtureModel::new(components)?);
    }

    HmmModel::new(r.name.clone(), transitions, states)
}

/// Save a model set to `path`, optionally gzip-compressed.
pub fn save<P: AsRef<Path>>(set: &HmmSet, path: P, compress: bool) -> Result<()> {
    let record = SetRecord {
        version: FORMAT_VERSION,
        mapping: set.mapping().to_vec(),
        models: (0..set.num_physical())
            .map(|p| model_to_record(set.physical_model(p)))
            .collect(),
    };
    let json = serde_json::to_vec(&record)
        .map_err(|e| HmmError::Persist(format!("serialization failed: {e}")))?;

    let mut file = File::create(path)?;
    if compress {
        let mut encoder = GzEncoder::new(&mut file, Compression::default());
        encoder.write_all(&json)?;
        encoder.finish()?;
    } else {
        file.write_all(&json)?;
    }
    Ok(())
}

/// Load a model set saved by [`save`], auto-detecting compression.
pub fn load<P: AsRef<Path>>(path: P) -> Result<HmmSet> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;

    let json = if raw.len() >= 2 && raw[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(&raw[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        out
    } else {
        raw
    };

    let record: SetRecord = serde_json::from_slice(&json)
        .map_err(|e| HmmError::Persist(format!("deserialization failed: {e}")))?;
    if record.version != FORMAT_VERSION {
        return Err(HmmError::Persist(format!(
            "unsupported model file version {}",
            record.version
        )));
    }

    let models = record
        .models
        .iter()
        .map(model_from_record)
        .collect::<Result<Vec<_>>>()?;
    HmmSet::with_mapping(models, record.mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn sample_set() -> HmmSet {
        let states = vec![
            MixtureModel::new(vec![
                MixtureComponent {
                    weight: 0.7,
                    gaussian: GaussianModel::new(
                        array![0.25, -1.5],
                        Covariance::Full(array![[1.5, 0.2], [0.2, 0.75]]),
                    )
                    .unwrap(),
                },
                MixtureComponent {
                    weight: 0.3,
                    gaussian: GaussianModel::new(
                        array![2.0, 0.5],
                        Covariance::Diagonal(array![0.5, 1.25]),
                    )
                    .unwrap(),
                },
            ])
            .unwrap(),
            MixtureModel::single(GaussianModel::with_identity(array![3.0, 3.0])),
        ];
        let model = HmmModel::left_right_no_skip("word0", 0.6, states).unwrap();
        HmmSet::with_mapping(vec![model], vec![0, 0]).unwrap()
    }

    fn stored_params(set: &HmmSet) -> Vec<f32> {
        let mut out = Vec::new();
        for p in 0..set.num_physical() {
            let m = set.physical_model(p);
            for v in m.log_transitions().iter() {
                out.push(v.exp() as f32);
            }
            for mix in m.states() {
                for c in mix.components() {
                    out.push(c.weight as f32);
                    for &x in c.gaussian.mean().iter() {
                        out.push(x as f32);
                    }
                    match c.gaussian.covariance() {
                        Covariance::Full(cov) => out.extend(cov.iter().map(|&x| x as f32)),
                        Covariance::Diagonal(v) => out.extend(v.iter().map(|&x| x as f32)),
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_save_load_round_trip_bit_exact_at_f32() {
        let dir = tempdir().unwrap();
        let set = sample_set();

        for compress in [false, true] {
            let path = dir.path().join(if compress { "m.gz" } else { "m.json" });
            save(&set, &path, compress).unwrap();
            let loaded = load(&path).unwrap();

            // save(load(m)) must reproduce the stored parameters exactly.
            let path2 = dir.path().join("roundtrip");
            save(&loaded, &path2, false).unwrap();
            let again = load(&path2).unwrap();

            let a = stored_params(&loaded);
            let b = stored_params(&again);
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(b.iter()) {
                assert_eq!(x.to_bits(), y.to_bits());
            }

            assert_eq!(loaded.mapping(), set.mapping());
            assert_eq!(loaded.physical_model(0).name(), "word0");
            assert_eq!(loaded.physical_model(0).num_states(), 2);
        }
    }

    #[test]
    fn test_compressed_file_is_gzip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.gz");
        save(&sample_set(), &path, true).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &GZIP_MAGIC);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, b"not a model").unwrap();
        assert!(matches!(load(&path), Err(HmmError::Persist(_))));
    }
}
