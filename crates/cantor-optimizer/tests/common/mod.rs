//! Shared builders and harnesses for optimizer integration tests.
#![allow(dead_code)]

use std::collections::HashMap;

use cantor_core::{
    Command, Component, Computation, Executor, MatrixInit, Network,
};
use cantor_optimizer::{optimize_computation, OptimizeConfig};

/// One link in a test chain: how matrix `i` is computed from matrix `i-1`.
#[derive(Debug, Clone)]
pub enum ChainOp {
    /// `m_i = m_{i-1}` — mergeable when both views are whole.
    Copy,

    /// `m_i += m_{i-1}` — never a merge candidate.
    Add,

    /// `m_i = component(m_{i-1})`.
    Propagate(Component),

    /// `m_i = component.backprop(m_{i-1})`, using `m_{i-1}` for both the
    /// forward value and the output derivative.
    Backprop(Component),
}

/// Build `in -> op_1 -> ... -> op_k -> out` over equally shaped matrices.
///
/// Matrix 0 is bound as input "in", matrix k as output "out". Every matrix
/// gets a whole-view submatrix, allocation happens just before first use,
/// and deallocation just after last use. `Add` destinations are
/// zero-initialized so the accumulation is well-defined.
pub fn build_chain(
    rows: usize,
    cols: usize,
    ops: &[ChainOp],
    network: &mut Network,
) -> Computation {
    let mut c = Computation::new();
    let k = ops.len();

    let matrices: Vec<_> = (0..=k)
        .map(|i| {
            let init = match i.checked_sub(1).map(|j| &ops[j]) {
                Some(ChainOp::Add) => MatrixInit::Zeroed,
                _ => MatrixInit::Undefined,
            };
            c.add_matrix(rows, cols, init)
        })
        .collect();
    let views: Vec<_> = matrices
        .iter()
        .map(|&m| c.add_whole_submatrix(m).unwrap())
        .collect();

    c.bindings.bind_input("in", matrices[0]);
    c.bindings.bind_output("out", matrices[k]);

    c.commands.push(Command::AllocateMatrix(matrices[0]));
    for (i, op) in ops.iter().enumerate() {
        let (src, dst) = (views[i], views[i + 1]);
        c.commands.push(Command::AllocateMatrix(matrices[i + 1]));
        c.commands.push(match op {
            ChainOp::Copy => Command::Copy { dst, src },
            ChainOp::Add => Command::Add { dst, src },
            ChainOp::Propagate(component) => Command::Propagate {
                component: network.add_component(component.clone()),
                input: src,
                output: dst,
            },
            ChainOp::Backprop(component) => Command::Backprop {
                component: network.add_component(component.clone()),
                out_value: src,
                out_deriv: src,
                in_deriv: dst,
            },
        });
        c.commands.push(Command::DeallocateMatrix(matrices[i]));
    }
    c
}

/// Execute a single-input computation and return its outputs.
pub fn run(
    network: &Network,
    computation: &Computation,
    input: &[f32],
) -> HashMap<String, Vec<f32>> {
    Executor::new(network, computation)
        .set_input("in", input.to_vec())
        .run()
        .unwrap()
}

/// Optimize a copy of `computation` and assert the central properties:
/// identical outputs, a consistent graph, and no growth in matrix count.
///
/// Returns the optimized computation for further assertions.
pub fn assert_optimize_preserves(
    network: &Network,
    computation: &Computation,
    input: &[f32],
) -> Computation {
    let before = run(network, computation, input);

    let mut optimized = computation.clone();
    optimize_computation(&OptimizeConfig::default(), network, &mut optimized).unwrap();

    // No dangling references anywhere in the optimized graph.
    optimized.check(network).unwrap();
    assert!(
        optimized.num_matrices() <= computation.num_matrices(),
        "optimization grew the matrix table: {} -> {}",
        computation.num_matrices(),
        optimized.num_matrices()
    );

    let after = run(network, &optimized, input);
    assert_eq!(before, after, "optimization changed computed values");
    optimized
}
