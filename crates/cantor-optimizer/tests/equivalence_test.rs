//! Property tests: optimization must never change what a computation computes.

mod common;

use cantor_core::{Component, Network};
use cantor_optimizer::{remove_no_ops, remove_orphan_matrices};
use common::{assert_optimize_preserves, ChainOp};
use proptest::prelude::*;

fn chain_op(kind: u8) -> ChainOp {
    match kind {
        0 => ChainOp::Copy,
        1 => ChainOp::Add,
        2 => ChainOp::Propagate(Component::Sigmoid),
        3 => ChainOp::Propagate(Component::Tanh),
        4 => ChainOp::Propagate(Component::Rectify),
        5 => ChainOp::Propagate(Component::Softmax),
        6 => ChainOp::Propagate(Component::Scale(1.5)),
        7 => ChainOp::Backprop(Component::Scale(0.5)),
        _ => ChainOp::Backprop(Component::Sigmoid),
    }
}

fn chain_strategy() -> impl Strategy<Value = (usize, usize, Vec<ChainOp>, Vec<f32>)> {
    (1usize..4, 1usize..6, proptest::collection::vec(0u8..9, 1..8)).prop_flat_map(
        |(rows, cols, kinds)| {
            let ops: Vec<ChainOp> = kinds.into_iter().map(chain_op).collect();
            proptest::collection::vec(-8.0f32..8.0, rows * cols)
                .prop_map(move |input| (rows, cols, ops.clone(), input))
        },
    )
}

proptest! {
    #[test]
    fn optimized_chain_computes_identical_outputs(
        (rows, cols, ops, input) in chain_strategy()
    ) {
        let mut network = Network::new();
        let computation = common::build_chain(rows, cols, &ops, &mut network);
        computation.check(&network).unwrap();

        let optimized = assert_optimize_preserves(&network, &computation, &input);

        // Cleanup is a fixed point: running it again changes nothing.
        let mut again = optimized.clone();
        remove_orphan_matrices(&mut again).unwrap();
        remove_no_ops(&mut again);
        prop_assert_eq!(again, optimized);
    }
}
