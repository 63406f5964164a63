//! Activation functions: forward values and output-based derivatives.

use approx::assert_abs_diff_eq;
use convnet::utils::{self, NUMERIC_BOUND, SYMMETRIC_TANH_ALPHA};
use convnet::Activation;

const DIFFERENTIABLE: [Activation; 4] = [
    Activation::Logistic,
    Activation::Tanh,
    Activation::SymmetricTanh,
    Activation::Identity,
];

#[test]
fn test_derivatives_match_finite_differences() {
    let h = 1e-6;
    for activation in DIFFERENTIABLE {
        for &x in &[-2.5, -0.7, 0.0, 0.3, 1.9] {
            let numeric = (activation.apply(x + h) - activation.apply(x - h)) / (2.0 * h);
            let analytic = activation.derivative(activation.apply(x));
            assert!(
                (numeric - analytic).abs() < 1e-6,
                "{} at {x}: numeric {numeric} vs analytic {analytic}",
                activation.name()
            );
        }
    }
}

#[test]
fn test_relu_derivative_is_a_step() {
    assert_eq!(Activation::Relu.derivative(Activation::Relu.apply(-1.0)), 0.0);
    assert_eq!(Activation::Relu.derivative(Activation::Relu.apply(2.0)), 1.0);
}

#[test]
fn test_symmetric_tanh_range() {
    assert_abs_diff_eq!(
        Activation::SymmetricTanh.apply(50.0),
        SYMMETRIC_TANH_ALPHA,
        epsilon = 1e-9
    );
    assert_abs_diff_eq!(
        Activation::SymmetricTanh.apply(1.5),
        1.7159 * (2.0f64 / 3.0 * 1.5).tanh(),
        epsilon = 1e-4
    );
}

#[test]
fn test_softmax_keeps_its_forward_identity() {
    for &x in &[-3.0, 0.0, 0.4] {
        assert_eq!(Activation::SoftMax.apply(x), x);
        assert_abs_diff_eq!(Activation::SoftMax.derivative(x), x * (1.0 - x), epsilon = 1e-12);
    }
}

#[test]
fn test_extreme_inputs_stay_finite() {
    for activation in [
        Activation::Logistic,
        Activation::Tanh,
        Activation::SymmetricTanh,
    ] {
        for &x in &[-1.0e300, -1.0e6, 1.0e6, 1.0e300] {
            let y = activation.apply(x);
            assert!(y.is_finite(), "{} at {x} gave {y}", activation.name());
            assert!(activation.derivative(y).is_finite());
        }
    }
    assert_eq!(utils::exp(1.0e6), NUMERIC_BOUND);
}

#[test]
fn test_activation_from_topology_names() {
    for (name, activation) in [
        ("\"logistic\"", Activation::Logistic),
        ("\"symmetric_tanh\"", Activation::SymmetricTanh),
        ("\"soft_max\"", Activation::SoftMax),
        ("\"none\"", Activation::None),
    ] {
        let parsed: Activation = serde_json::from_str(name).unwrap();
        assert_eq!(parsed, activation);
    }
}
