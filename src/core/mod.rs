//! Core engine: connection graphs, layers, and the network orchestrator.
//!
//! - [`topology`] builds the per-neuron connection lists and weight layout of a layer
//! - [`layer`] owns neuron and weight state and runs the per-kind strategies
//! - [`network`] drives forward passes, backpropagation, and weight persistence
//!
//! ## Forward / backward
//!
//! For every neuron `i` with connections `c`:
//! ```text
//! sum_i    = Σ_c w[c.weight] * (c.source == Bias ? 1 : prev.out[c.source])
//! out_i    = f(sum_i)
//! delta_i  = f'(out_i) * err_i
//! grad[w] += delta_i * (c.source == Bias ? 1 : prev.out[c.source])
//! prev.err[c.source] += delta_i * w[c.weight]
//! ```

pub mod layer;
pub mod network;
pub mod topology;

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::utils;

pub use layer::{Layer, Neurons, Weights};
pub use network::{Network, OutputRange};
pub use topology::{
    build_graph, Connection, ConnectionGraph, Incidence, LayerKind, LayerSpec, MapGeometry,
    Mapping, Source, Topology, Window,
};

/// Error type for engine operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// Invalid layer topology, mapping, or network setup.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// A weight file does not hold exactly one record per declared weight.
    #[error("weight file holds {found} records but the network declares {expected}")]
    WeightCountMismatch { expected: usize, found: usize },
    /// A weight file is truncated or its records are out of order.
    #[error("malformed weight file: {0}")]
    MalformedWeights(String),
    /// Sample data that does not fit the declared dataset geometry.
    #[error("invalid dataset: {0}")]
    Dataset(String),
    /// An input buffer does not match the input layer.
    #[error("input holds {found} values but the input layer expects {expected}")]
    InputSize { expected: usize, found: usize },
    /// A checkpoint could not be written or removed.
    #[error("checkpoint {} failed: {source}", path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    /// The background training thread panicked.
    #[error("training thread panicked")]
    TrainerPanicked,
}

pub type NetResult<T> = Result<T, NetError>;

/// Activation function applied by a layer to each weighted sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Logistic,
    #[default]
    Tanh,
    /// `1.7159 * tanh(2x/3)`
    SymmetricTanh,
    Relu,
    Identity,
    /// Identity forward with a logistic-shaped derivative.
    SoftMax,
    /// Input layer only; behaves as identity.
    None,
}

impl Activation {
    /// Apply the activation: f(x)
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Logistic => utils::logistic(x),
            Activation::Tanh => utils::tanh(x),
            Activation::SymmetricTanh => utils::symmetric_tanh(x),
            Activation::Relu => utils::relu(x),
            Activation::Identity | Activation::SoftMax | Activation::None => utils::identity(x),
        }
    }

    /// Derivative of the activation, evaluated from the output `y = f(x)`.
    #[inline]
    pub fn derivative(self, y: f64) -> f64 {
        match self {
            Activation::Logistic => utils::d_logistic(y),
            Activation::Tanh => utils::d_tanh(y),
            Activation::SymmetricTanh => utils::d_symmetric_tanh(y),
            Activation::Relu => utils::d_relu(y),
            Activation::SoftMax => utils::d_softmax(y),
            Activation::Identity | Activation::None => utils::d_identity(y),
        }
    }

    /// Name for debugging
    pub fn name(self) -> &'static str {
        match self {
            Activation::Logistic => "logistic",
            Activation::Tanh => "tanh",
            Activation::SymmetricTanh => "symmetric_tanh",
            Activation::Relu => "relu",
            Activation::Identity => "identity",
            Activation::SoftMax => "softmax",
            Activation::None => "none",
        }
    }
}
