//! Layer state and the per-kind compute, backpropagate, erase and update strategies.

use ndarray::{Array1, Zip};
use ndarray_rand::rand_distr::{Distribution, Normal};
use rand::Rng;
use tracing::debug;

use super::topology::{
    build_graph, Connection, ConnectionGraph, LayerKind, LayerSpec, MapGeometry, Source,
};
use super::{Activation, NetError, NetResult};

/// Neuron state of a layer, structure-of-arrays.
#[derive(Debug, Clone)]
pub struct Neurons {
    /// Activation outputs
    pub output: Array1<f64>,
    /// Error signal (dLoss/dOutput) written by the next layer, or by the loss for the last
    pub error: Array1<f64>,
}

impl Neurons {
    fn zeros(count: usize) -> Self {
        Self {
            output: Array1::zeros(count),
            error: Array1::zeros(count),
        }
    }
}

/// Weight state of a layer, structure-of-arrays.
#[derive(Debug, Clone)]
pub struct Weights {
    pub value: Array1<f64>,
    /// Value before the last update
    pub previous: Array1<f64>,
    /// Gradient accumulator for the current sample
    pub gradient: Array1<f64>,
}

impl Weights {
    fn zeros(count: usize) -> Self {
        Self {
            value: Array1::zeros(count),
            previous: Array1::zeros(count),
            gradient: Array1::zeros(count),
        }
    }
}

/// One layer of the network.
///
/// Layers live in the network's ordered arena; the previous layer is handed in by the
/// caller for every pass instead of being referenced from here.
#[derive(Debug, Clone)]
pub struct Layer {
    spec: LayerSpec,
    graph: ConnectionGraph,
    neurons: Neurons,
    weights: Weights,
    /// f'(output) * error, per neuron, from the last backward pass
    delta: Array1<f64>,
    /// Max pooling: connection slot that held the window maximum
    winners: Array1<usize>,
    learning_rate: f64,
    momentum: f64,
}

#[inline]
fn input_of(source: Source, previous: &Array1<f64>) -> f64 {
    match source {
        Source::Bias => 1.0,
        Source::Neuron(n) => previous[n],
    }
}

/// Per-connection multipliers that differ between layer kinds.
struct Gain<'a> {
    kind: LayerKind,
    connections: &'a [Vec<Connection>],
    winners: &'a Array1<usize>,
}

impl Gain<'_> {
    /// Factor applied to a connection's term in the weighted sum and in its weight gradient.
    #[inline]
    fn forward(&self, neuron: usize, slot: usize) -> f64 {
        if slot == 0 {
            return 1.0;
        }
        match self.kind {
            // the list length counts the bias, so this is 1 / window members
            LayerKind::AvgPooling => 1.0 / (self.connections[neuron].len() - 1) as f64,
            LayerKind::MaxPooling => self.winner(neuron, slot),
            _ => 1.0,
        }
    }

    /// Factor applied to the error term pushed back through a connection.
    #[inline]
    fn backward(&self, neuron: usize, slot: usize) -> f64 {
        match self.kind {
            LayerKind::MaxPooling => self.winner(neuron, slot),
            _ => 1.0,
        }
    }

    #[inline]
    fn winner(&self, neuron: usize, slot: usize) -> f64 {
        if self.winners[neuron] == slot {
            1.0
        } else {
            0.0
        }
    }
}

impl Layer {
    /// Build a layer from its declaration.
    ///
    /// `previous` is the geometry of the layer below, `None` for the input layer.
    /// `learning_rate` and `momentum` apply unless the spec overrides them.
    ///
    /// # Errors
    /// - `Configuration` if an input layer has a predecessor, another kind has none, or the
    ///   connection graph cannot be built
    pub fn new(
        spec: LayerSpec,
        previous: Option<&MapGeometry>,
        learning_rate: f64,
        momentum: f64,
    ) -> NetResult<Self> {
        let graph = match (spec.kind, previous) {
            (LayerKind::Input, None) => ConnectionGraph::default(),
            (LayerKind::Input, Some(_)) => {
                return Err(NetError::Configuration(
                    "input layer must be the first layer".to_string(),
                ))
            }
            (_, None) => {
                return Err(NetError::Configuration(format!(
                    "{:?} layer needs a previous layer",
                    spec.kind
                )))
            }
            (_, Some(previous)) => build_graph(&spec, previous)?,
        };

        let count = spec.geometry.neuron_count();
        debug!(
            kind = ?spec.kind,
            activation = spec.activation.name(),
            neurons = count,
            weights = graph.weight_count,
            connections = graph.connection_count(),
            "built layer"
        );

        Ok(Self {
            learning_rate: spec.learning_rate.unwrap_or(learning_rate),
            momentum: spec.momentum.unwrap_or(momentum),
            neurons: Neurons::zeros(count),
            weights: Weights::zeros(graph.weight_count),
            delta: Array1::zeros(count),
            winners: Array1::zeros(count),
            graph,
            spec,
        })
    }

    pub fn kind(&self) -> LayerKind {
        self.spec.kind
    }

    pub fn activation(&self) -> Activation {
        self.spec.activation
    }

    pub fn geometry(&self) -> &MapGeometry {
        &self.spec.geometry
    }

    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }

    pub fn graph(&self) -> &ConnectionGraph {
        &self.graph
    }

    pub fn connections(&self) -> &[Vec<Connection>] {
        &self.graph.connections
    }

    pub fn neuron_count(&self) -> usize {
        self.neurons.output.len()
    }

    pub fn weight_count(&self) -> usize {
        self.graph.weight_count
    }

    pub fn neurons(&self) -> &Neurons {
        &self.neurons
    }

    pub fn neurons_mut(&mut self) -> &mut Neurons {
        &mut self.neurons
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut Weights {
        &mut self.weights
    }

    pub fn outputs(&self) -> &Array1<f64> {
        &self.neurons.output
    }

    pub fn errors(&self) -> &Array1<f64> {
        &self.neurons.error
    }

    /// Connection slot of each max-pooling neuron's window maximum (zero for other kinds).
    pub fn winners(&self) -> &Array1<usize> {
        &self.winners
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    /// Draw every weight from `Normal(0, 1/sqrt(fan_in))`, where `fan_in` is the connection
    /// count of the first neuron reading it. Unreferenced slots are zeroed.
    ///
    /// # Errors
    /// - `Configuration` if a distribution cannot be built
    pub fn initialize_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) -> NetResult<()> {
        for w in 0..self.graph.weight_count {
            let fan_in = self
                .graph
                .weight_refs
                .get(w)
                .first()
                .map(|&(neuron, _)| self.graph.connections[neuron].len());
            self.weights.value[w] = match fan_in {
                Some(fan_in) => Normal::new(0.0, 1.0 / (fan_in as f64).sqrt())
                    .map_err(|e| NetError::Configuration(e.to_string()))?
                    .sample(rng),
                None => 0.0,
            };
        }
        self.weights.previous.fill(0.0);
        self.weights.gradient.fill(0.0);
        Ok(())
    }

    /// Forward pass of this layer from `previous`'s outputs.
    pub fn compute(&mut self, previous: &Layer) {
        let Layer {
            spec,
            graph,
            neurons,
            weights,
            winners,
            ..
        } = self;
        let activation = spec.activation;
        let connections = &graph.connections;
        let value = &weights.value;
        let input = &previous.neurons.output;

        match spec.kind {
            LayerKind::Input => {}
            LayerKind::FullyConnected
            | LayerKind::Convolutional
            | LayerKind::Local
            | LayerKind::AvgPooling => {
                let gain = Gain {
                    kind: spec.kind,
                    connections,
                    winners,
                };
                Zip::indexed(&mut neurons.output).par_for_each(|i, out| {
                    let sum: f64 = connections[i]
                        .iter()
                        .enumerate()
                        .map(|(slot, c)| {
                            gain.forward(i, slot) * value[c.weight] * input_of(c.source, input)
                        })
                        .sum();
                    *out = activation.apply(sum);
                });
            }
            LayerKind::MaxPooling => {
                Zip::indexed(&mut neurons.output)
                    .and(winners)
                    .par_for_each(|i, out, winner| {
                        let list = &connections[i];
                        let mut best = f64::MIN;
                        let mut best_slot = 1;
                        for (slot, c) in list.iter().enumerate().skip(1) {
                            let v = input_of(c.source, input);
                            if v >= best {
                                best = v;
                                best_slot = slot;
                            }
                        }
                        *winner = best_slot;
                        let sum = value[list[0].weight] + value[list[best_slot].weight] * best;
                        *out = activation.apply(sum);
                    });
            }
        }
    }

    /// Zero the gradient accumulators.
    pub fn erase_gradients(&mut self) {
        self.weights.gradient.par_mapv_inplace(|_| 0.0);
    }

    /// Backward pass: accumulate weight gradients from this layer's error signal and write
    /// the previous layer's error signal.
    ///
    /// Each weight and each previous neuron sums its own references in a fixed order, so the
    /// result does not depend on how many threads run the pass.
    pub fn backpropagate(&mut self, previous: &mut Layer) {
        if self.spec.kind == LayerKind::Input {
            return;
        }
        let Layer {
            spec,
            graph,
            neurons,
            weights,
            delta,
            winners,
            ..
        } = self;
        let activation = spec.activation;

        Zip::from(&mut *delta)
            .and(&neurons.output)
            .and(&neurons.error)
            .par_for_each(|d, &y, &e| *d = activation.derivative(y) * e);

        let delta = &*delta;
        let connections = &graph.connections;
        let gain = Gain {
            kind: spec.kind,
            connections,
            winners,
        };
        let input = &previous.neurons.output;

        Zip::indexed(&mut weights.gradient).par_for_each(|w, g| {
            *g += graph
                .weight_refs
                .get(w)
                .iter()
                .map(|&(n, slot)| {
                    delta[n] * gain.forward(n, slot) * input_of(connections[n][slot].source, input)
                })
                .sum::<f64>();
        });

        // nothing reads the input layer's error signal
        if previous.spec.kind == LayerKind::Input {
            return;
        }
        let value = &weights.value;
        Zip::indexed(&mut previous.neurons.error).par_for_each(|p, e| {
            *e = graph
                .source_refs
                .get(p)
                .iter()
                .map(|&(n, slot)| {
                    delta[n] * gain.backward(n, slot) * value[connections[n][slot].weight]
                })
                .sum();
        });
    }

    /// Apply the epoch-scaled SGD step to every weight:
    ///
    /// ```text
    /// delta    = (lr / epoch) * gradient - (momentum / epoch) * lr * value
    /// previous = value
    /// value    = value - delta
    /// ```
    ///
    /// # Errors
    /// - `Configuration` if `epoch` is 0
    pub fn update_weights(&mut self, epoch: usize) -> NetResult<()> {
        if epoch == 0 {
            return Err(NetError::Configuration(
                "weight update requested at epoch 0".to_string(),
            ));
        }
        let step = self.learning_rate / epoch as f64;
        let decay = self.momentum / epoch as f64 * self.learning_rate;

        let Weights {
            value,
            previous,
            gradient,
        } = &mut self.weights;
        Zip::from(value)
            .and(previous)
            .and(&*gradient)
            .par_for_each(|v, p, &g| {
                *p = *v;
                *v -= step * g - decay * *v;
            });
        Ok(())
    }
}
