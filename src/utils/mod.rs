//! Math utilities: scalar activation functions, their derivatives, and the numeric guard.
//!
//! Derivatives take the neuron's *output* (the value after activation), because the
//! backward pass only keeps outputs around.

/// Magnitude limit applied to `exp`/`log` results.
pub const NUMERIC_BOUND: f64 = 1.0e20;

/// Scale of the symmetric tanh (LeCun's 1.7159).
pub const SYMMETRIC_TANH_ALPHA: f64 = 1.715_934_28;

/// Input gain of the symmetric tanh.
pub const SYMMETRIC_TANH_BETA: f64 = 2.0 / 3.0;

/// Clamp a value to `[-NUMERIC_BOUND, NUMERIC_BOUND]`.
#[inline]
pub fn bound(x: f64) -> f64 {
    x.clamp(-NUMERIC_BOUND, NUMERIC_BOUND)
}

/// `exp` with its result clamped to the numeric bound.
#[inline]
pub fn exp(x: f64) -> f64 {
    bound(x.exp())
}

/// Natural log with its result clamped to the numeric bound.
#[inline]
pub fn ln(x: f64) -> f64 {
    bound(x.ln())
}

/// Logistic function: `1 / (1 + exp(-x))`.
#[inline]
pub fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + exp(-x))
}

/// Derivative of the logistic function, from its output.
#[inline]
pub fn d_logistic(y: f64) -> f64 {
    y * (1.0 - y)
}

/// Hyperbolic tangent computed as `2 / (1 + exp(-2x)) - 1`.
#[inline]
pub fn tanh(x: f64) -> f64 {
    2.0 / (1.0 + exp(-2.0 * x)) - 1.0
}

/// Derivative of tanh, from its output.
#[inline]
pub fn d_tanh(y: f64) -> f64 {
    1.0 - y * y
}

/// Scaled tanh: `α * tanh(β x)`.
#[inline]
pub fn symmetric_tanh(x: f64) -> f64 {
    SYMMETRIC_TANH_ALPHA * tanh(SYMMETRIC_TANH_BETA * x)
}

/// Derivative of the scaled tanh, from its output: `(β/α)(α² - y²)`.
#[inline]
pub fn d_symmetric_tanh(y: f64) -> f64 {
    SYMMETRIC_TANH_BETA / SYMMETRIC_TANH_ALPHA
        * (SYMMETRIC_TANH_ALPHA * SYMMETRIC_TANH_ALPHA - y * y)
}

/// Rectified linear unit: `max(0, x)`.
#[inline]
pub fn relu(x: f64) -> f64 {
    if x < 0.0 {
        0.0
    } else {
        x
    }
}

/// Derivative of ReLU, from its output.
#[inline]
pub fn d_relu(y: f64) -> f64 {
    if y > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Identity.
#[inline]
pub fn identity(x: f64) -> f64 {
    x
}

/// Derivative of identity.
#[inline]
pub fn d_identity(_y: f64) -> f64 {
    1.0
}

/// Logistic-shaped derivative used by the soft-max output layer, whose forward pass is
/// the identity.
#[inline]
pub fn d_softmax(y: f64) -> f64 {
    y * (1.0 - y)
}

/// Hyperbolic secant via the guarded `exp`.
#[inline]
pub fn sech(x: f64) -> f64 {
    2.0 / (exp(x) + exp(-x))
}
