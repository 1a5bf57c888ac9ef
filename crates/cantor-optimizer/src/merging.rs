//! Variable merging: proving two matrices can share storage, and merging them.
//!
//! Suppose the computation contains matrices m1 and m2, whole-matrix views
//! s1 of m1 and s2 of m2, and a command C that is one of:
//! - the assignment `s2 = s1`,
//! - a propagate with input s1 and output s2 whose component supports
//!   in-place propagation,
//! - a backprop with output-derivative s1 and input-derivative s2 whose
//!   component supports in-place backprop.
//!
//! If after C nothing touches m1 except its deallocation, and before C
//! nothing touches m2 except its allocation (and the zeroing that may come
//! with it), then m2's storage can be m1's storage: every submatrix of m2 is
//! rewritten to reference m1, the lifecycle commands are fixed up, and for
//! the assignment case C itself degenerates to a no-op. Cleanup later
//! deduplicates the now-identical views and drops the orphaned m2 entry.

use cantor_core::{Command, Computation, Network, Result, SubmatrixId};
use tracing::debug;

use crate::analysis::Analysis;
use crate::OptimizeConfig;

/// Performs merges on one computation until no more candidates remain.
///
/// One instance performs at most one pass: each successful merge invalidates
/// the access analysis, so the optimizer re-analyzes and rescans after every
/// merge, and a per-matrix guard keeps any matrix from being merged twice
/// within the pass. The caller may instantiate a fresh optimizer to hunt for
/// opportunities that only appear after other passes have run.
pub struct VariableMergingOptimizer<'a> {
    config: &'a OptimizeConfig,
    network: &'a Network,
    computation: &'a mut Computation,
    analysis: Analysis,

    /// True for each matrix that has already been part of a merge (as either
    /// side), so later candidates in the same pass cannot re-touch it.
    already_merged: Vec<bool>,

    /// Commands whose defensive re-check failed; skipped for the rest of the
    /// pass.
    exhausted: Vec<bool>,
}

impl<'a> VariableMergingOptimizer<'a> {
    /// Analyze `computation` and prepare a merging pass over it.
    pub fn new(
        config: &'a OptimizeConfig,
        network: &'a Network,
        computation: &'a mut Computation,
    ) -> Result<Self> {
        let analysis = Analysis::compute(computation)?;
        let already_merged = vec![false; computation.num_matrices()];
        let exhausted = vec![false; computation.commands.len()];
        Ok(Self {
            config,
            network,
            computation,
            analysis,
            already_merged,
            exhausted,
        })
    }

    /// Run the pass. Returns `true` if any merge was performed.
    ///
    /// Each iteration scans the command sequence in order, performs the
    /// first legal merge it finds, then recomputes the analysis before
    /// scanning again. Termination: every merge consumes two matrices'
    /// un-merged status, and nothing ever clears the guard.
    pub fn merge_variables(&mut self) -> Result<bool> {
        let mut merged_any = false;
        while let Some((command, s1, s2)) = self.find_candidate()? {
            if !self.do_merge(command, s1, s2)? {
                self.exhausted[command] = true;
                continue;
            }
            merged_any = true;
            // Command indices are stable (removed commands become no-ops),
            // but every read/write set and lifecycle index is now stale.
            self.analysis = Analysis::compute(self.computation)?;
        }
        Ok(merged_any)
    }

    /// Scan the command sequence for the first eligible, legal (s1, s2) pair.
    fn find_candidate(&self) -> Result<Option<(usize, SubmatrixId, SubmatrixId)>> {
        for (c, command) in self.computation.commands.iter().enumerate() {
            if self.exhausted[c] {
                continue;
            }
            let pair = match command {
                Command::Copy { dst, src } if self.config.remove_assignments => {
                    Some((*src, *dst))
                }
                Command::Propagate {
                    component,
                    input,
                    output,
                } if self.config.propagate_in_place
                    && self
                        .network
                        .component(*component)?
                        .supports_in_place_propagate() =>
                {
                    Some((*input, *output))
                }
                Command::Backprop {
                    component,
                    out_deriv,
                    in_deriv,
                    ..
                } if self.config.backprop_in_place
                    && self
                        .network
                        .component(*component)?
                        .supports_in_place_backprop() =>
                {
                    Some((*out_deriv, *in_deriv))
                }
                _ => None,
            };
            if let Some((s1, s2)) = pair {
                if self.is_candidate(c, s1, s2)? {
                    return Ok(Some((c, s1, s2)));
                }
            }
        }
        Ok(None)
    }

    /// Check whether merging (s1, s2) at `command` preserves semantics.
    ///
    /// All of the following must hold:
    /// - s1 != s2, and both are whole-matrix views;
    /// - neither parent has been merged already in this pass;
    /// - m1 is not a network output, m2 is not a network input;
    /// - the parents have identical extents;
    /// - after `command`, no part of m1 is accessed, apart from deallocating
    ///   it (a later write would clobber m2's live contents, so writes are
    ///   rejected too, not just reads);
    /// - before `command`, no part of m2 is accessed, apart from its
    ///   allocation and the zeroing that allocation may perform.
    fn is_candidate(&self, command: usize, s1: SubmatrixId, s2: SubmatrixId) -> Result<bool> {
        if s1 == s2 {
            return Ok(false);
        }
        if !self.computation.is_whole_submatrix(s1)? || !self.computation.is_whole_submatrix(s2)? {
            return Ok(false);
        }

        let m1 = self.computation.submatrix_matrix(s1)?;
        let m2 = self.computation.submatrix_matrix(s2)?;
        if m1 == m2 {
            return Ok(false);
        }
        if self.already_merged[m1.index()] || self.already_merged[m2.index()] {
            return Ok(false);
        }

        let ma1 = &self.analysis.matrix_accesses[m1.index()];
        let ma2 = &self.analysis.matrix_accesses[m2.index()];
        if ma1.is_output || ma2.is_input {
            return Ok(false);
        }

        let info1 = self.computation.matrix(m1)?;
        let info2 = self.computation.matrix(m2)?;
        if info1.rows != info2.rows || info1.cols != info2.cols {
            return Ok(false);
        }

        // The deallocation itself carries no variable access, so it never
        // appears in the access list.
        if ma1.accesses.iter().any(|a| a.command > command) {
            return Ok(false);
        }
        if ma2
            .accesses
            .iter()
            .any(|a| a.command < command && Some(a.command) != ma2.allocate_command)
        {
            return Ok(false);
        }

        Ok(true)
    }

    /// Merge m2 (parent of s2) into m1 (parent of s1).
    ///
    /// Re-checks the candidate conditions first and mutates nothing if they
    /// no longer hold; the merge is never partially applied. Removed
    /// commands become no-ops so command indices stay stable for the rest of
    /// the pass.
    fn do_merge(&mut self, command: usize, s1: SubmatrixId, s2: SubmatrixId) -> Result<bool> {
        if !self.is_candidate(command, s1, s2)? {
            return Ok(false);
        }

        let m1 = self.computation.submatrix_matrix(s1)?;
        let m2 = self.computation.submatrix_matrix(s2)?;

        // Lifecycle command indices must come from the pre-merge analysis;
        // after retargeting below they would be ambiguous.
        let m1_dealloc = self.analysis.matrix_accesses[m1.index()].deallocate_command;
        let m2_alloc = self.analysis.matrix_accesses[m2.index()].allocate_command;
        let m2_dealloc = self.analysis.matrix_accesses[m2.index()].deallocate_command;
        let m2_is_output = self.analysis.matrix_accesses[m2.index()].is_output;

        let kind = match &self.computation.commands[command] {
            Command::Copy { .. } => "copy",
            Command::Propagate { .. } => "propagate",
            Command::Backprop { .. } => "backprop",
            _ => "other",
        };
        debug!(
            command,
            kind,
            m1 = m1.index(),
            m2 = m2.index(),
            "merging matrices"
        );

        // Every view of m2 becomes a view of m1 at the same range; cleanup
        // deduplicates the resulting identical views later.
        for sub in self.computation.submatrices.iter_mut() {
            if sub.matrix == m2 {
                sub.matrix = m1;
            }
        }

        // m1 takes over m2's output binding, if any, before any lifecycle
        // command is touched.
        if m2_is_output {
            self.computation.bindings.replace_output(m2, m1);
        }

        // The assignment case is now a self-copy; drop it. The in-place
        // propagate/backprop cases stay, reading and writing the same
        // storage.
        if matches!(self.computation.commands[command], Command::Copy { .. }) {
            self.computation.commands[command] = Command::NoOp;
        }

        // m2's storage is now provided by m1's allocation: retarget m2's
        // deallocation to m1 and drop m1's own deallocation and m2's
        // allocation. When m2 is an output it has no deallocation, and the
        // merged matrix correctly stays live for the caller.
        if let Some(d) = m2_dealloc {
            self.computation.commands[d] = Command::DeallocateMatrix(m1);
        }
        if let Some(d) = m1_dealloc {
            self.computation.commands[d] = Command::NoOp;
        }
        if let Some(a) = m2_alloc {
            self.computation.commands[a] = Command::NoOp;
        }

        self.already_merged[m1.index()] = true;
        self.already_merged[m2.index()] = true;
        Ok(true)
    }
}
