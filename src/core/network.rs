//! Network orchestrator: owns the ordered layer arena and drives forward passes,
//! backpropagation, weight updates and weight persistence.

use ndarray::{Array1, ArrayView1, Zip};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use super::layer::Layer;
use super::topology::{LayerKind, LayerSpec, Topology};
use super::{NetError, NetResult};
use crate::checkpoint;
use crate::data::Sample;
use crate::pool::{PoolStats, WorkerPool};
use crate::Config;

/// Range the network's inputs and targets are mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputRange {
    pub min: f64,
    pub max: f64,
}

impl Default for OutputRange {
    fn default() -> Self {
        Self {
            min: -1.0,
            max: 1.0,
        }
    }
}

impl OutputRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// `|max| - min`
    pub fn spread(&self) -> f64 {
        self.max.abs() - self.min
    }

    /// Map a pixel byte into the range: `byte / 255 * spread + min`.
    #[inline]
    pub fn scale_pixel(&self, byte: u8) -> f64 {
        f64::from(byte) / 255.0 * self.spread() + self.min
    }

    /// Map a label value in `[0, 1]` into the range.
    #[inline]
    pub fn scale_label(&self, label: f64) -> f64 {
        label * self.spread() + self.min
    }
}

/// A feed-forward network: layer 0 is the input buffer, the last layer the output.
///
/// # Architecture
///
/// - **Layers:** owned in order; each pass hands a layer its predecessor by index
/// - **Training scalars:** per-layer learning rate and momentum, defaulting to the
///   network-wide values the network was created with
/// - **Pool:** every data-parallel loop runs on the network's own worker pool
pub struct Network {
    name: String,
    class_count: usize,
    range: OutputRange,
    learning_rate: f64,
    momentum: f64,
    layers: Vec<Layer>,
    pool: WorkerPool,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("class_count", &self.class_count)
            .field("range", &self.range)
            .field("layers", &format!("<{} layers>", self.layers.len()))
            .field("weights", &self.weight_count())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Network {
    /// Empty network; add layers with [`Network::add_layer`], input layer first.
    ///
    /// # Errors
    /// - `Configuration` if `class_count` is 0
    /// - `Pool` if the worker pool cannot be started
    pub fn new(
        name: impl Into<String>,
        class_count: usize,
        range: OutputRange,
        config: &Config,
    ) -> NetResult<Self> {
        if class_count == 0 {
            return Err(NetError::Configuration(
                "a network needs at least one class".to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            class_count,
            range,
            learning_rate: config.learning_rate,
            momentum: config.momentum,
            layers: Vec::new(),
            pool: WorkerPool::new(config.threads)?,
        })
    }

    /// Build every layer of `topology` and check the result.
    ///
    /// # Errors
    /// - `Configuration` for any invalid layer or if the output size is not the class count
    pub fn from_topology(topology: &Topology, config: &Config) -> NetResult<Self> {
        let mut network = Self::new(
            topology.name.clone(),
            topology.class_count,
            topology.range,
            config,
        )?;
        for spec in &topology.layers {
            network.add_layer(spec.clone())?;
        }
        network.validate()?;
        Ok(network)
    }

    /// Append a layer on top of the current last layer.
    ///
    /// # Errors
    /// - `Configuration` if the layer cannot be wired to its predecessor
    pub fn add_layer(&mut self, spec: LayerSpec) -> NetResult<()> {
        let previous = self.layers.last().map(|layer| *layer.geometry());
        let layer = Layer::new(spec, previous.as_ref(), self.learning_rate, self.momentum)?;
        self.layers.push(layer);
        Ok(())
    }

    /// Check that the network has an input and an output layer of `class_count` neurons.
    ///
    /// # Errors
    /// - `Configuration` describing the first problem found
    pub fn validate(&self) -> NetResult<()> {
        if self.layers.len() < 2 {
            return Err(NetError::Configuration(format!(
                "network needs an input and an output layer, has {} layers",
                self.layers.len()
            )));
        }
        let outputs = self.last()?.neuron_count();
        if outputs != self.class_count {
            return Err(NetError::Configuration(format!(
                "output layer has {outputs} neurons but there are {} classes",
                self.class_count
            )));
        }
        Ok(())
    }

    /// Draw fresh weights for every layer from a seeded generator.
    ///
    /// # Errors
    /// - `Configuration` if a layer's distribution cannot be built
    pub fn initialize_weights(&mut self, seed: u64) -> NetResult<()> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for layer in self.layers.iter_mut().skip(1) {
            layer.initialize_weights(&mut rng)?;
        }
        debug!(seed, weights = self.weight_count(), "initialized weights");
        Ok(())
    }

    /// Replace the worker pool; `None` uses every available core.
    ///
    /// # Errors
    /// - `Pool` if the new pool cannot be started
    pub fn set_threads(&mut self, threads: Option<usize>) -> NetResult<()> {
        self.pool = WorkerPool::new(threads)?;
        Ok(())
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_count(&self) -> usize {
        self.class_count
    }

    pub fn range(&self) -> OutputRange {
        self.range
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    /// Total trainable weights across all non-input layers.
    pub fn weight_count(&self) -> usize {
        self.layers.iter().map(Layer::weight_count).sum()
    }

    /// Number of input values (neurons of layer 0).
    pub fn input_size(&self) -> usize {
        self.layers.first().map_or(0, Layer::neuron_count)
    }

    fn input_layer_mut(&mut self, found: usize) -> NetResult<&mut Layer> {
        let expected = self.input_size();
        let input = self
            .layers
            .first_mut()
            .filter(|layer| layer.kind() == LayerKind::Input)
            .ok_or_else(|| NetError::Configuration("network has no input layer".to_string()))?;
        if found != expected {
            return Err(NetError::InputSize { expected, found });
        }
        Ok(input)
    }

    fn last(&self) -> NetResult<&Layer> {
        self.layers
            .last()
            .ok_or_else(|| NetError::Configuration("network has no layers".to_string()))
    }

    /// Copy pixel bytes into the input layer, mapped through the output range.
    ///
    /// # Errors
    /// - `InputSize` if `bytes` does not match the input layer
    pub fn set_input(&mut self, bytes: &[u8]) -> NetResult<()> {
        let range = self.range;
        let input = self.input_layer_mut(bytes.len())?;
        Zip::from(&mut input.neurons_mut().output)
            .and(ArrayView1::from(bytes))
            .for_each(|out, &b| *out = range.scale_pixel(b));
        Ok(())
    }

    /// Copy already-scaled values into the input layer.
    ///
    /// # Errors
    /// - `InputSize` if `values` does not match the input layer
    pub fn set_input_values(&mut self, values: &[f64]) -> NetResult<()> {
        let input = self.input_layer_mut(values.len())?;
        input
            .neurons_mut()
            .output
            .assign(&ArrayView1::from(values));
        Ok(())
    }

    /// Run every non-input layer's forward strategy in order.
    pub fn forward(&mut self) {
        let Network { layers, pool, .. } = self;
        pool.install(|| {
            for l in 1..layers.len() {
                let (below, above) = layers.split_at_mut(l);
                above[0].compute(&below[l - 1]);
            }
        });
    }

    /// Forward-only inference: returns the output layer's values.
    ///
    /// # Errors
    /// - `InputSize` if `bytes` does not match the input layer
    pub fn calculate(&mut self, bytes: &[u8]) -> NetResult<Array1<f64>> {
        self.set_input(bytes)?;
        self.forward();
        Ok(self.outputs()?.clone())
    }

    /// Output layer values from the last forward pass.
    ///
    /// # Errors
    /// - `Configuration` if the network has no layers
    pub fn outputs(&self) -> NetResult<&Array1<f64>> {
        Ok(self.last()?.outputs())
    }

    /// Label distribution mapped through the output range.
    ///
    /// # Errors
    /// - `Dataset` if there is not one label per class
    pub fn targets(&self, labels: &[f64]) -> NetResult<Array1<f64>> {
        if labels.len() != self.class_count {
            return Err(NetError::Dataset(format!(
                "{} labels for {} classes",
                labels.len(),
                self.class_count
            )));
        }
        Ok(labels.iter().map(|&t| self.range.scale_label(t)).collect())
    }

    /// Mean-squared-error loss of the current outputs: `0.5 * Σ (out - target)²`.
    ///
    /// # Errors
    /// - `Dataset` if there is not one label per class
    pub fn loss(&self, labels: &[f64]) -> NetResult<f64> {
        let targets = self.targets(labels)?;
        let outputs = self.outputs()?;
        Ok(0.5
            * outputs
                .iter()
                .zip(&targets)
                .map(|(o, t)| (o - t) * (o - t))
                .sum::<f64>())
    }

    /// Forward `sample` and write `out - target` into the last layer's error signal.
    /// Returns the sample's loss.
    fn forward_sample(&mut self, sample: &Sample) -> NetResult<f64> {
        self.validate()?;
        let targets = self.targets(&sample.labels)?;
        self.set_input(&sample.pixels)?;
        self.forward();

        let last = self.layers.len() - 1;
        let neurons = self.layers[last].neurons_mut();
        Zip::from(&mut neurons.error)
            .and(&neurons.output)
            .and(&targets)
            .for_each(|e, &o, &t| *e = o - t);
        Ok(0.5 * neurons.error.iter().map(|e| e * e).sum::<f64>())
    }

    /// Erase and backpropagate layer `l`, then update it when an epoch is given.
    fn backward_layer(&mut self, l: usize, epoch: Option<usize>) -> NetResult<()> {
        let Network { layers, pool, .. } = self;
        let (below, above) = layers.split_at_mut(l);
        let previous = &mut below[l - 1];
        let current = &mut above[0];
        pool.install(|| {
            current.erase_gradients();
            current.backpropagate(previous);
            match epoch {
                Some(epoch) => current.update_weights(epoch),
                None => Ok(()),
            }
        })
    }

    /// Forward pass and backward pass on one sample without updating any weight.
    /// Gradients are left in each layer's accumulators. Returns the sample's loss.
    ///
    /// # Errors
    /// - `InputSize` / `Dataset` if the sample does not fit the network
    pub fn compute_gradients(&mut self, sample: &Sample) -> NetResult<f64> {
        let loss = self.forward_sample(sample)?;
        for l in (1..self.layers.len()).rev() {
            self.backward_layer(l, None)?;
        }
        Ok(loss)
    }

    /// One online SGD step: forward, loss, then erase, backpropagate and update every
    /// non-input layer from last to first. Returns the loss measured before the update.
    ///
    /// # Errors
    /// - `InputSize` / `Dataset` if the sample does not fit the network
    /// - `Configuration` if `epoch` is 0
    pub fn train_sample(&mut self, sample: &Sample, epoch: usize) -> NetResult<f64> {
        if epoch == 0 {
            return Err(NetError::Configuration(
                "epochs are counted from 1".to_string(),
            ));
        }
        let loss = self.forward_sample(sample)?;
        for l in (1..self.layers.len()).rev() {
            self.backward_layer(l, Some(epoch))?;
        }
        Ok(loss)
    }

    /// Apply the update rule to every non-input layer using its current gradients.
    ///
    /// # Errors
    /// - `Configuration` if `epoch` is 0
    pub fn update(&mut self, epoch: usize) -> NetResult<()> {
        let Network { layers, pool, .. } = self;
        pool.install(|| {
            layers
                .iter_mut()
                .skip(1)
                .try_for_each(|layer| layer.update_weights(epoch))
        })
    }

    /// Write all weight values to a binary weight file.
    ///
    /// # Errors
    /// - `Resource` if the file cannot be written
    pub fn save_weights(&self, path: &Path) -> NetResult<()> {
        checkpoint::save_weights(self, path)
    }

    /// Load weight values from a binary weight file. The network is unchanged on error.
    ///
    /// # Errors
    /// - `Io`, `MalformedWeights` or `WeightCountMismatch`
    pub fn load_weights(&mut self, path: &Path) -> NetResult<()> {
        checkpoint::load_weights(self, path)
    }

    /// Index of the largest output (first on ties).
    pub fn arg_max(&self) -> Option<usize> {
        let outputs = self.layers.last()?.outputs();
        let mut best = None;
        let mut best_value = f64::MIN;
        for (i, &v) in outputs.iter().enumerate().take(self.class_count) {
            if v > best_value {
                best_value = v;
                best = Some(i);
            }
        }
        best
    }

    /// Index of the smallest output (first on ties).
    pub fn arg_min(&self) -> Option<usize> {
        let outputs = self.layers.last()?.outputs();
        let mut best = None;
        let mut best_value = f64::MAX;
        for (i, &v) in outputs.iter().enumerate().take(self.class_count) {
            if v < best_value {
                best_value = v;
                best = Some(i);
            }
        }
        best
    }
}
