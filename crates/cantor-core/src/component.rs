//! Network components and their capability flags.
//!
//! The optimizer only ever asks a component two questions: can it propagate
//! in place, and can it backprop in place. The numeric bodies exist so the
//! reference executor can run computations for equivalence checking; they
//! are not a production inference backend.

/// A network component, with fixed in-place capability flags per variant.
///
/// `Backprop` commands carry the component's forward output value, so
/// components whose gradient depends on it (the nonlinearities here) are
/// expressible without re-running the forward pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    /// Logistic sigmoid, elementwise.
    Sigmoid,

    /// Hyperbolic tangent, elementwise.
    Tanh,

    /// Rectified linear unit, elementwise.
    Rectify,

    /// Row-wise softmax.
    Softmax,

    /// Multiply by a fixed scalar.
    Scale(f32),
}

impl Component {
    /// Component name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Component::Sigmoid => "Sigmoid",
            Component::Tanh => "Tanh",
            Component::Rectify => "Rectify",
            Component::Softmax => "Softmax",
            Component::Scale(_) => "Scale",
        }
    }

    /// Can this component compute its forward output over the same storage
    /// as its input?
    pub fn supports_in_place_propagate(&self) -> bool {
        match self {
            Component::Sigmoid
            | Component::Tanh
            | Component::Rectify
            | Component::Softmax
            | Component::Scale(_) => true,
        }
    }

    /// Can this component compute its input derivative over the same storage
    /// as the output derivative?
    pub fn supports_in_place_backprop(&self) -> bool {
        match self {
            Component::Sigmoid | Component::Tanh | Component::Rectify | Component::Scale(_) => true,
            // Softmax backprop needs the whole output-derivative row while
            // writing the input derivative.
            Component::Softmax => false,
        }
    }

    /// Forward pass: read `input`, set `output`. Both are row-major with
    /// `cols` columns and equal lengths.
    pub fn propagate(&self, cols: usize, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), output.len());
        match self {
            Component::Sigmoid => {
                for (y, &x) in output.iter_mut().zip(input) {
                    *y = 1.0 / (1.0 + (-x).exp());
                }
            }
            Component::Tanh => {
                for (y, &x) in output.iter_mut().zip(input) {
                    *y = x.tanh();
                }
            }
            Component::Rectify => {
                for (y, &x) in output.iter_mut().zip(input) {
                    *y = x.max(0.0);
                }
            }
            Component::Softmax => {
                for (in_row, out_row) in input.chunks(cols).zip(output.chunks_mut(cols)) {
                    let max = in_row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    let mut sum = 0.0;
                    for (y, &x) in out_row.iter_mut().zip(in_row) {
                        *y = (x - max).exp();
                        sum += *y;
                    }
                    for y in out_row.iter_mut() {
                        *y /= sum;
                    }
                }
            }
            Component::Scale(alpha) => {
                for (y, &x) in output.iter_mut().zip(input) {
                    *y = alpha * x;
                }
            }
        }
    }

    /// Backward pass: read the forward output `out_value` and `out_deriv`,
    /// set `in_deriv`. All slices are row-major with `cols` columns.
    pub fn backprop(&self, cols: usize, out_value: &[f32], out_deriv: &[f32], in_deriv: &mut [f32]) {
        debug_assert_eq!(out_value.len(), out_deriv.len());
        debug_assert_eq!(out_deriv.len(), in_deriv.len());
        match self {
            Component::Sigmoid => {
                for ((dx, &y), &dy) in in_deriv.iter_mut().zip(out_value).zip(out_deriv) {
                    *dx = dy * y * (1.0 - y);
                }
            }
            Component::Tanh => {
                for ((dx, &y), &dy) in in_deriv.iter_mut().zip(out_value).zip(out_deriv) {
                    *dx = dy * (1.0 - y * y);
                }
            }
            Component::Rectify => {
                for ((dx, &y), &dy) in in_deriv.iter_mut().zip(out_value).zip(out_deriv) {
                    *dx = if y > 0.0 { dy } else { 0.0 };
                }
            }
            Component::Softmax => {
                for ((dx_row, y_row), dy_row) in in_deriv
                    .chunks_mut(cols)
                    .zip(out_value.chunks(cols))
                    .zip(out_deriv.chunks(cols))
                {
                    let dot: f32 = y_row.iter().zip(dy_row).map(|(&y, &dy)| y * dy).sum();
                    for ((dx, &y), &dy) in dx_row.iter_mut().zip(y_row).zip(dy_row) {
                        *dx = y * (dy - dot);
                    }
                }
            }
            Component::Scale(alpha) => {
                for (dx, &dy) in in_deriv.iter_mut().zip(out_deriv) {
                    *dx = alpha * dy;
                }
            }
        }
    }
}
