//! # convnet
//!
//! A from-scratch feed-forward and convolutional neural network engine trained with online
//! stochastic gradient descent.
//!
//! ## Overview
//!
//! Layers are described by sparse per-neuron connection lists rather than dense matrices.
//! Convolutional layers tie one kernel across every position of a feature map, local layers
//! give each position private weights, and pooling layers carry a learnable scale and bias.
//! The backward pass reduces shared-weight gradients in a fixed order, so training results
//! are identical for any number of worker threads.
//!
//! ## Structure
//!
//! - [`core`]: connection graphs, layers, the network orchestrator, errors
//! - [`training`]: the epoch loop, the background trainer and its status channel
//! - [`data`]: the dataset contract and a labelled-record loader
//! - [`checkpoint`]: binary weight files and checkpoint naming
//! - [`pool`]: the bounded worker pool
//! - [`utils`]: activation functions and the numeric guard

pub mod checkpoint;
pub mod core;
pub mod data;
pub mod pool;
pub mod training;
pub mod utils;

pub use crate::core::{
    Activation, Connection, LayerKind, LayerSpec, MapGeometry, Mapping, NetError, NetResult,
    Network, OutputRange, Source, Topology, Window,
};
pub use data::{Dataset, InMemoryDataset, Sample, SampleOrder};
pub use training::{EpochMetrics, Status, Trainer, TrainingControl, TrainingReport};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Training hyper-parameters and run settings.
///
/// Used by [`Network::new`] for layer defaults and by [`training::run`] for the epoch loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub epochs: usize,
    /// Default learning rate of layers that do not set their own
    pub learning_rate: f64,
    /// Default momentum of layers that do not set their own
    pub momentum: f64,
    /// Worker threads; `None` uses every available core
    pub threads: Option<usize>,
    /// Seed for weight initialization and sample shuffling
    pub seed: u64,
    /// Where final weights (and `weights/` checkpoints) are written
    pub output_dir: PathBuf,
    /// Write a checkpoint after every epoch
    pub checkpoints: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epochs: 100,
            learning_rate: 0.005,
            momentum: 0.0005,
            threads: None,
            seed: 0,
            output_dir: PathBuf::from("."),
            checkpoints: true,
        }
    }
}

impl Config {
    /// Read a configuration from JSON; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> NetResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
