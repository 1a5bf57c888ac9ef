//! Post-compilation computation-graph optimizer for cantor.
//!
//! Takes the low-level command sequence the compiler emitted and reduces its
//! memory traffic by proving pairs of matrices can share storage and merging
//! them, then sweeps up the debris. The pipeline is:
//!
//! 1. **Access analysis** (`analysis`) — who reads/writes what, when.
//! 2. **Variable merging** (`merging`) — find a legal merge, apply it,
//!    re-analyze, repeat to a fixed point.
//! 3. **Cleanup** (`cleanup`) — deduplicate views, drop orphaned matrices,
//!    delete no-op commands.
//!
//! The optimizer mutates the computation in place and never applies a
//! partial transformation: every precondition is verified before the first
//! mutation of a merge, so there is no rollback path.

pub mod analysis;
pub mod cleanup;
pub mod merging;

pub use analysis::Analysis;
pub use cleanup::{remove_no_ops, remove_orphan_matrices};
pub use merging::VariableMergingOptimizer;

// Every optimizer failure is an IR-consistency failure, so the core error
// type is the crate error type.
pub use cantor_core::{Error, Result};

use cantor_core::{Computation, Network};
use tracing::debug;

/// Options controlling the optimizer.
///
/// The individual switches exist mainly for debugging the optimizer itself:
/// if an optimized computation misbehaves, disabling one merge kind at a
/// time narrows down which transformation introduced the fault.
#[derive(Debug, Clone)]
pub struct OptimizeConfig {
    /// Master switch; `false` disables the whole pass.
    pub optimize: bool,

    /// Allow merges triggered by in-place-capable propagate commands.
    pub propagate_in_place: bool,

    /// Allow merges triggered by in-place-capable backprop commands.
    pub backprop_in_place: bool,

    /// Allow merges triggered by copy commands.
    pub remove_assignments: bool,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            optimize: true,
            propagate_in_place: true,
            backprop_in_place: true,
            remove_assignments: true,
        }
    }
}

/// Top-level entry: merge variables to a fixed point, then clean up.
///
/// Mutates the computation in place. The input must satisfy the model
/// invariants (`Computation::check`); a malformed graph is a fatal error,
/// not something to optimize around.
///
/// A fresh [`VariableMergingOptimizer`] is instantiated after every pass
/// that changed something, because a completed merge can expose candidates
/// the previous pass's per-matrix guard suppressed.
#[tracing::instrument(skip_all, fields(
    num_commands = computation.commands.len(),
    num_matrices = computation.num_matrices(),
))]
pub fn optimize_computation(
    config: &OptimizeConfig,
    network: &Network,
    computation: &mut Computation,
) -> Result<()> {
    computation.check(network)?;
    if !config.optimize {
        return Ok(());
    }

    let matrices_before = computation.num_matrices();
    loop {
        let mut optimizer = VariableMergingOptimizer::new(config, network, computation)?;
        if !optimizer.merge_variables()? {
            break;
        }
    }

    remove_orphan_matrices(computation)?;
    remove_no_ops(computation);
    computation.check(network)?;

    debug!(
        matrices_before,
        matrices_after = computation.num_matrices(),
        num_commands = computation.commands.len(),
        "optimization finished"
    );
    Ok(())
}
