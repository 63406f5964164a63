//! Finite-difference checks of the backward pass.
//!
//! For every weight `w`, the analytic gradient left in the accumulator by
//! `compute_gradients` must match `(L(w + h) - L(w - h)) / 2h` on the same sample.

use approx::assert_abs_diff_eq;
use convnet::data::Sample;
use convnet::{Activation, Config, LayerSpec, MapGeometry, Network, OutputRange, Window};

const STEP: f64 = 1e-6;
const TOLERANCE: f64 = 1e-5;

fn network(name: &str, class_count: usize, layers: Vec<LayerSpec>) -> Network {
    let config = Config {
        threads: Some(2),
        ..Config::default()
    };
    let mut network = Network::new(name, class_count, OutputRange::default(), &config)
        .expect("valid network");
    for spec in layers {
        network.add_layer(spec).expect("valid layer");
    }
    network.validate().expect("complete network");
    network.initialize_weights(7).expect("initialized");
    network
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 37 + 11) % 256) as u8).collect()
}

fn loss_at(network: &mut Network, sample: &Sample) -> f64 {
    network.calculate(&sample.pixels).expect("input fits");
    network.loss(&sample.labels).expect("labels fit")
}

/// Compare every analytic gradient of every weighted layer with a central difference.
fn check_all_gradients(network: &mut Network, sample: &Sample) {
    network.compute_gradients(sample).expect("gradients");
    let analytic: Vec<Vec<f64>> = network
        .layers()
        .iter()
        .map(|layer| layer.weights().gradient.to_vec())
        .collect();

    for l in 1..network.layers().len() {
        for w in 0..network.layers()[l].weight_count() {
            let original = network.layers()[l].weights().value[w];

            network.layers_mut()[l].weights_mut().value[w] = original + STEP;
            let plus = loss_at(network, sample);
            network.layers_mut()[l].weights_mut().value[w] = original - STEP;
            let minus = loss_at(network, sample);
            network.layers_mut()[l].weights_mut().value[w] = original;

            let numeric = (plus - minus) / (2.0 * STEP);
            assert!(
                (numeric - analytic[l][w]).abs() < TOLERANCE,
                "layer {l} weight {w}: numeric {numeric} vs analytic {}",
                analytic[l][w]
            );
        }
    }
}

#[test]
fn test_fully_connected_gradients() {
    let mut network = network(
        "dense",
        2,
        vec![
            LayerSpec::input(4, 1, 1),
            LayerSpec::fully_connected(Activation::Tanh, 3),
            LayerSpec::fully_connected(Activation::Tanh, 2),
        ],
    );
    let sample = Sample::new(vec![10, 200, 90, 255], vec![1.0, 0.0]);
    check_all_gradients(&mut network, &sample);
}

#[test]
fn test_mixed_activation_gradients() {
    let mut network = network(
        "activations",
        3,
        vec![
            LayerSpec::input(5, 1, 1),
            LayerSpec::fully_connected(Activation::Logistic, 4),
            LayerSpec::fully_connected(Activation::SymmetricTanh, 4),
            LayerSpec::fully_connected(Activation::Identity, 3),
        ],
    );
    let sample = Sample::new(pattern(5), vec![0.0, 1.0, 0.0]);
    check_all_gradients(&mut network, &sample);
}

#[test]
fn test_convolution_pooling_local_gradients() {
    let mut network = network(
        "spatial",
        2,
        vec![
            LayerSpec::input(1, 6, 6),
            LayerSpec::convolutional(Activation::Tanh, MapGeometry::new(2, 6, 6), Window::new(3, 3))
                .with_padding(1, 1),
            LayerSpec::max_pooling(
                Activation::Identity,
                MapGeometry::new(2, 3, 3),
                Window::new(2, 2),
                Window::new(2, 2),
            ),
            LayerSpec::local(Activation::Tanh, MapGeometry::new(2, 2, 2), Window::new(2, 2)),
            LayerSpec::fully_connected(Activation::Tanh, 2),
        ],
    );
    assert_eq!(network.layers()[1].weight_count(), 2 * 9 + 2);
    assert_eq!(network.layers()[3].weight_count(), 2 * 2 * 4 * 5);

    let sample = Sample::new(pattern(36), vec![0.0, 1.0]);
    check_all_gradients(&mut network, &sample);
}

#[test]
fn test_strided_convolution_gradients() {
    let mut network = network(
        "strided",
        2,
        vec![
            LayerSpec::input(2, 5, 5),
            LayerSpec::convolutional(Activation::Tanh, MapGeometry::new(3, 2, 2), Window::new(3, 3))
                .with_stride(2, 2),
            LayerSpec::fully_connected(Activation::Tanh, 2),
        ],
    );
    let sample = Sample::new(pattern(50), vec![1.0, 0.0]);
    check_all_gradients(&mut network, &sample);
}

#[test]
fn test_avg_pooling_weight_gradients() {
    // only the pooling layer's own weights and the layers above it: the error pushed below
    // an average pool is deliberately left unscaled
    let mut network = network(
        "avg",
        2,
        vec![
            LayerSpec::input(2, 4, 4),
            LayerSpec::avg_pooling(
                Activation::Tanh,
                MapGeometry::new(2, 2, 2),
                Window::new(2, 2),
                Window::new(2, 2),
            ),
            LayerSpec::fully_connected(Activation::Tanh, 2),
        ],
    );
    let sample = Sample::new(pattern(32), vec![0.0, 1.0]);
    check_all_gradients(&mut network, &sample);
}

#[test]
fn test_max_pooling_routes_error_to_arg_max() {
    let mut network = network(
        "route",
        1,
        vec![
            LayerSpec::input(1, 2, 2),
            LayerSpec::convolutional(
                Activation::Identity,
                MapGeometry::new(1, 2, 2),
                Window::unit(),
            ),
            LayerSpec::max_pooling(
                Activation::Identity,
                MapGeometry::new(1, 1, 1),
                Window::new(2, 2),
                Window::new(2, 2),
            ),
        ],
    );
    // 1x1 kernel of weight 1 and no bias: the window sees the scaled pixels unchanged
    network.layers_mut()[1].weights_mut().value.assign(&ndarray::arr1(&[0.0, 1.0]));
    network.layers_mut()[2].weights_mut().value.assign(&ndarray::arr1(&[0.0, 1.0]));

    let sample = Sample::new(vec![140, 230, 30, 150], vec![1.0]);
    network.compute_gradients(&sample).expect("gradients");

    let pool = &network.layers()[2];
    assert_eq!(pool.winners()[0], 2);
    assert_abs_diff_eq!(pool.outputs()[0], 230.0 / 255.0 * 2.0 - 1.0, epsilon = 1e-12);

    let errors = network.layers()[1].errors();
    assert!(errors[1] != 0.0);
    for &silent in &[0, 2, 3] {
        assert_eq!(errors[silent], 0.0);
    }
}
