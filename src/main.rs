//! Training and decoding CLI
//!
//! Command-line interface for flat-start initialization, embedded
//! Baum-Welch training, Viterbi decoding and classification.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use hmm_seq::data::{load_corpus, load_sequence};
use hmm_seq::models::{encode_run_lengths, load, save, HmmModel, HmmSet};
use hmm_seq::train::EmbeddedReestimator;
use hmm_seq::TrainingConfig;
use ndarray::Array1;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hmm_seq")]
#[command(about = "Continuous-density HMM training and decoding for frame sequences")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a flat-start model set from corpus statistics
    Init {
        /// Corpus directory containing manifest.csv
        #[arg(short, long)]
        corpus: String,

        /// Emitting states per model
        #[arg(short = 'n', long, default_value = "3")]
        states: usize,

        /// Mixture components per state
        #[arg(short, long, default_value = "1")]
        mixtures: usize,

        /// Output model file
        #[arg(short, long)]
        output: String,

        /// Gzip-compress the model file
        #[arg(long)]
        compress: bool,
    },

    /// Train a model set on a corpus
    Train {
        /// Corpus directory containing manifest.csv
        #[arg(short, long)]
        corpus: String,

        /// Input model file
        #[arg(short, long)]
        model: String,

        /// Output model file
        #[arg(short, long)]
        output: String,

        /// Maximum EM iterations
        #[arg(short, long, default_value = "20")]
        iterations: usize,

        /// Pruning beam width (log probability)
        #[arg(long, default_value = "200.0")]
        beam: f64,

        /// Convergence threshold on the average log-likelihood delta
        #[arg(long, default_value = "1e-4")]
        threshold: f64,

        /// Gzip-compress the output model file
        #[arg(long)]
        compress: bool,
    },

    /// Viterbi-decode one sequence against one model
    Decode {
        /// Model file
        #[arg(short, long)]
        model: String,

        /// Sequence CSV file
        #[arg(short, long)]
        input: String,

        /// Logical model index to decode against
        #[arg(short = 'x', long, default_value = "0")]
        index: usize,
    },

    /// Score one sequence against every model in a set
    Score {
        /// Model file
        #[arg(short, long)]
        model: String,

        /// Sequence CSV file
        #[arg(short, long)]
        input: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hmm_seq=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            corpus,
            states,
            mixtures,
            output,
            compress,
        } => init_models(&corpus, states, mixtures, &output, compress),
        Commands::Train {
            corpus,
            model,
            output,
            iterations,
            beam,
            threshold,
            compress,
        } => train_models(
            &corpus,
            &model,
            &output,
            iterations,
            beam,
            threshold,
            compress,
        ),
        Commands::Decode {
            model,
            input,
            index,
        } => decode_sequence(&model, &input, index),
        Commands::Score { model, input } => score_sequence(&model, &input),
    }
}

fn init_models(
    corpus_dir: &str,
    states: usize,
    mixtures: usize,
    output: &str,
    compress: bool,
) -> Result<()> {
    println!("{}", "Loading corpus...".cyan());
    let corpus = load_corpus(corpus_dir)?;
    let dim = corpus
        .dim()
        .context("corpus has no utterances to take statistics from")?;
    println!("Loaded {} utterances, {} frames", corpus.len(), corpus.total_frames());

    // Corpus-global mean and variance for the flat start
    let mut mean = Array1::<f64>::zeros(dim);
    let mut count = 0.0;
    for u in &corpus.utterances {
        for t in 0..u.features.len() {
            mean += &u.features.frame(t);
            count += 1.0;
        }
    }
    mean /= count;

    let mut variance = Array1::<f64>::zeros(dim);
    for u in &corpus.utterances {
        for t in 0..u.features.len() {
            let diff = &u.features.frame(t) - &mean;
            variance += &diff.mapv(|v| v * v);
        }
    }
    variance /= count;

    let num_models = corpus
        .utterances
        .iter()
        .flat_map(|u| u.transcription.iter())
        .max()
        .map(|&m| m + 1)
        .context("corpus transcriptions are empty")?;

    println!(
        "{}",
        format!(
            "Flat-starting {num_models} model(s): {states} states, {mixtures} mixture(s) each"
        )
        .cyan()
    );

    let models = (0..num_models)
        .map(|i| HmmModel::flat_start(format!("model{i}"), states, mixtures, &mean, &variance))
        .collect::<hmm_seq::Result<Vec<_>>>()?;
    let set = HmmSet::new(models)?;

    save(&set, output, compress)?;
    println!("{}", format!("Saved model set to {output}").green());
    Ok(())
}

fn train_models(
    corpus_dir: &str,
    model_path: &str,
    output: &str,
    iterations: usize,
    beam: f64,
    threshold: f64,
    compress: bool,
) -> Result<()> {
    println!("{}", "Loading corpus...".cyan());
    let corpus = load_corpus(corpus_dir)?;
    println!("Loaded {} utterances", corpus.len());

    println!("{}", "Loading models...".cyan());
    let mut set = load(model_path)?;
    println!(
        "Loaded {} physical model(s), {} logical",
        set.num_physical(),
        set.num_logical()
    );

    let config = TrainingConfig::default()
        .with_max_iterations(iterations)
        .with_beam(beam)
        .with_convergence_threshold(threshold);

    println!(
        "{}",
        format!("Training (max {iterations} iterations, beam {beam})...").cyan()
    );
    let trainer = EmbeddedReestimator::new(config);
    let report = trainer.train(&mut set, &corpus)?;

    for pass in &report.passes {
        let skipped = pass.skipped_short + pass.skipped_beam;
        let line = format!(
            "  iter {:>3}: avg LL {:>12.4}  ({} used, {} skipped)",
            pass.iteration, pass.avg_log_likelihood, pass.used_utterances, skipped
        );
        if skipped > 0 {
            println!("{}", line.yellow());
        } else {
            println!("{line}");
        }
    }

    let status = if report.converged {
        "Converged".green()
    } else if report.cancelled {
        "Cancelled".yellow()
    } else {
        "Iteration limit reached".yellow()
    };
    println!("{status}");

    save(&set, output, compress)?;
    println!("{}", format!("Saved trained models to {output}").green());
    Ok(())
}

fn decode_sequence(model_path: &str, input: &str, index: usize) -> Result<()> {
    let set = load(model_path)?;
    let seq = load_sequence(input)?;

    let model = set.model(index)?;
    let alignment = model.viterbi(&seq)?;

    if !alignment.is_path_found() {
        println!(
            "{}",
            format!(
                "No valid path through model {} for {} frames",
                model.name(),
                seq.len()
            )
            .red()
        );
        return Ok(());
    }

    println!(
        "Model {} | {} frames | avg log-likelihood {:.4}",
        model.name().bold(),
        seq.len(),
        alignment.score
    );
    println!("State path (state x frames):");
    let runs = encode_run_lengths(&alignment.path);
    let rendered: Vec<String> = runs
        .iter()
        .map(|(state, count)| format!("{state}x{count}"))
        .collect();
    println!("  {}", rendered.join(" "));
    Ok(())
}

fn score_sequence(model_path: &str, input: &str) -> Result<()> {
    let set = load(model_path)?;
    let seq = load_sequence(input)?;

    let (best, _) = set.classify(&seq)?;
    println!("Scores over {} frames:", seq.len());
    for logical in 0..set.num_logical() {
        let model = set.model(logical)?;
        let score = model.score(&seq)?;
        let line = format!("  [{logical}] {:<16} {score:>12.4}", model.name());
        if logical == best {
            println!("{}", line.green().bold());
        } else {
            println!("{line}");
        }
    }
    Ok(())
}
