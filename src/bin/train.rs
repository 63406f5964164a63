//! Network training binary.
//!
//! Builds a network from a JSON topology, trains it on a labelled record file in the
//! background, and appends per-epoch metrics as JSONL.
//!
//! ## Usage
//!
//! ```bash
//! convnet-train \
//!   --topology nets/lenet.json \
//!   --data data/train.bin \
//!   --epochs 20 \
//!   --output-dir runs/lenet
//! ```

use clap::Parser;
use convnet::data::{load_labelled_records, RecordFormat};
use convnet::training::Trainer;
use convnet::{Config, Dataset, Network, Topology};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "convnet-train",
    about = "Train a convolutional network on labelled records"
)]
struct Args {
    /// Network topology (JSON)
    #[arg(long)]
    topology: PathBuf,

    /// Labelled record file: 1 label byte + planar pixels per record
    #[arg(long)]
    data: PathBuf,

    /// Training configuration (JSON); command-line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    momentum: Option<f64>,

    /// Worker threads (default: all cores)
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Directory for final weights and per-epoch checkpoints
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Skip per-epoch checkpoints
    #[arg(long, default_value_t = false)]
    no_checkpoints: bool,

    /// Start from an existing weight file instead of random weights
    #[arg(long)]
    resume: Option<PathBuf>,

    /// JSONL file that receives one line per epoch
    #[arg(long, default_value = "metrics.jsonl")]
    metrics_file: PathBuf,

    /// Stop cooperatively after this many seconds
    #[arg(long)]
    max_seconds: Option<u64>,

    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.learning_rate = learning_rate;
    }
    if let Some(momentum) = args.momentum {
        config.momentum = momentum;
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(output_dir) = &args.output_dir {
        config.output_dir = output_dir.clone();
    }
    if args.no_checkpoints {
        config.checkpoints = false;
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&args)?;
    let topology = Topology::from_json_file(&args.topology)?;
    let mut network = Network::from_topology(&topology, &config)?;

    let input = network.layers()[0].geometry();
    let format = RecordFormat {
        width: input.width,
        height: input.height,
        channels: input.maps,
        class_count: network.class_count(),
    };
    let dataset = load_labelled_records(&args.data, &format)?;

    match &args.resume {
        Some(path) => {
            network.load_weights(path)?;
            info!(path = %path.display(), "resumed weights");
        }
        None => network.initialize_weights(config.seed)?,
    }

    info!(
        network = network.name(),
        layers = network.layers().len(),
        weights = network.weight_count(),
        samples = dataset.sample_count(),
        epochs = config.epochs,
        learning_rate = config.learning_rate,
        momentum = config.momentum,
        threads = network.threads(),
        output_dir = %config.output_dir.display(),
        "configured training"
    );

    let mut trainer = Trainer::new(network, Arc::new(dataset), config);
    let updates = trainer.status().subscribe();
    trainer.start()?;

    let started = Instant::now();
    let deadline = args.max_seconds.map(Duration::from_secs);
    let mut last_log = Instant::now();
    while trainer.is_running() {
        match updates.recv_timeout(Duration::from_millis(200)) {
            Ok(text) if last_log.elapsed() >= Duration::from_secs(5) => {
                info!("{text}");
                last_log = Instant::now();
            }
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if deadline.is_some_and(|limit| started.elapsed() >= limit) {
            info!("time limit reached, stopping");
            trainer.control().request_stop();
        }
    }

    let Some(report) = trainer.wait()? else {
        warn!("training produced no report");
        return Ok(());
    };

    if let Some(parent) = args.metrics_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut metrics_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.metrics_file)?;
    for metrics in &report.metrics {
        writeln!(metrics_file, "{}", serde_json::to_string(metrics)?)?;
    }

    info!(
        epochs = report.epochs_completed,
        stopped = report.stopped,
        avg_loss = report.avg_loss,
        final_weights = ?report.final_weights,
        "training finished"
    );
    Ok(())
}
