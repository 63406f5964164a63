//! Network inference binary.
//!
//! Loads a topology and a weight file, then either classifies one raw input file or
//! evaluates accuracy over a labelled record file.

use clap::Parser;
use convnet::data::{load_labelled_records, RecordFormat};
use convnet::{Config, Dataset, Network, Topology};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "convnet-infer", about = "Run a trained convolutional network")]
struct Args {
    /// Network topology (JSON)
    #[arg(long)]
    topology: PathBuf,

    /// Weight file written by convnet-train
    #[arg(long)]
    weights: PathBuf,

    /// Raw input bytes of exactly one sample
    #[arg(long, conflicts_with = "data")]
    input: Option<PathBuf>,

    /// Labelled record file to evaluate
    #[arg(long)]
    data: Option<PathBuf>,

    /// Evaluate at most this many records
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long)]
    threads: Option<usize>,

    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

/// Index of the largest label (the record's class).
fn label_class(labels: &[f64]) -> Option<usize> {
    labels
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config {
        threads: args.threads,
        ..Config::default()
    };
    let topology = Topology::from_json_file(&args.topology)?;
    let mut network = Network::from_topology(&topology, &config)?;
    network.load_weights(&args.weights)?;
    info!(
        network = network.name(),
        weights = network.weight_count(),
        "loaded network"
    );

    if let Some(path) = &args.input {
        let bytes = fs::read(path)?;
        let outputs = network.calculate(&bytes)?;
        println!("{}", serde_json::to_string(&outputs.to_vec())?);
        if let Some(class) = network.arg_max() {
            println!("class: {class}");
        }
        return Ok(());
    }

    let Some(path) = &args.data else {
        return Err("either --input or --data is required".into());
    };
    let input = network.layers()[0].geometry();
    let format = RecordFormat {
        width: input.width,
        height: input.height,
        channels: input.maps,
        class_count: network.class_count(),
    };
    let dataset = load_labelled_records(path, &format)?;
    let count = args
        .limit
        .map_or(dataset.sample_count(), |n| n.min(dataset.sample_count()));

    let mut correct = 0usize;
    let mut total_loss = 0.0;
    for index in 0..count {
        let sample = dataset.sample(index);
        network.calculate(&sample.pixels)?;
        total_loss += network.loss(&sample.labels)?;
        let predicted = network.arg_max();
        if predicted.is_some() && predicted == label_class(&sample.labels) {
            correct += 1;
        }
        debug!(index, ?predicted, "classified record");
    }

    let accuracy = if count == 0 {
        0.0
    } else {
        correct as f64 / count as f64
    };
    let avg_loss = if count == 0 {
        0.0
    } else {
        total_loss / count as f64
    };
    info!(records = count, correct, accuracy, avg_loss, "evaluation finished");
    println!("accuracy: {accuracy:.4} ({correct}/{count}), avg loss: {avg_loss}");
    Ok(())
}
