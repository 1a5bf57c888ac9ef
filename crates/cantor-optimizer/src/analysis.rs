//! Access analysis over a computation.
//!
//! Derives, for every variable and every matrix, the ordered list of
//! commands that read or write it. This is the query surface the merging
//! optimizer's candidate checks are built on.
//!
//! A *variable* is the finest unit of storage distinct submatrices can
//! address: each matrix's column range is split at every submatrix boundary,
//! and one variable covers one resulting column stripe. Row subdivision is
//! deliberately collapsed — a view over part of a stripe's rows is treated
//! as accessing the whole stripe. That is conservative: it can hide a merge
//! opportunity, never manufacture an unsafe one.
//!
//! The whole analysis is recomputed from scratch after every structural
//! edit. Stale analysis is the single largest correctness hazard in this
//! design, so nothing here is incremental.

use cantor_core::{Command, Computation, MatrixId, Result, SubmatrixId};

/// Handle for a variable (one column stripe of one matrix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub usize);

impl VariableId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// How a command touches a variable or matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Value is read and left unchanged.
    Read,

    /// Value is overwritten without being read (an initializing write).
    Write,

    /// Value is read and written (an accumulating write, e.g. `Add`).
    ReadWrite,
}

impl AccessKind {
    /// Does this access observe the previous value?
    pub fn reads(&self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::ReadWrite)
    }

    /// Does this access change the value?
    pub fn writes(&self) -> bool {
        matches!(self, AccessKind::Write | AccessKind::ReadWrite)
    }
}

/// One command's access to one variable or matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub command: usize,
    pub kind: AccessKind,
}

/// The variable decomposition of a computation's matrices.
#[derive(Debug)]
pub struct ComputationVariables {
    /// Per matrix: sorted column split points, always including 0 and the
    /// full column count, plus every submatrix boundary.
    splits: Vec<Vec<usize>>,

    /// Per matrix: index of its first variable.
    matrix_start: Vec<usize>,

    num_variables: usize,
}

impl ComputationVariables {
    /// Build the variable decomposition for a computation.
    pub fn compute(computation: &Computation) -> Result<Self> {
        let num_matrices = computation.num_matrices();
        let mut splits: Vec<Vec<usize>> = (0..num_matrices)
            .map(|m| vec![0, computation.matrices[m].cols])
            .collect();
        for sub in &computation.submatrices {
            let points = &mut splits[sub.matrix.index()];
            points.push(sub.col_offset);
            points.push(sub.col_offset + sub.num_cols);
        }

        let mut matrix_start = Vec::with_capacity(num_matrices);
        let mut next = 0;
        for points in splits.iter_mut() {
            points.sort_unstable();
            points.dedup();
            matrix_start.push(next);
            next += points.len() - 1;
        }

        Ok(Self {
            splits,
            matrix_start,
            num_variables: next,
        })
    }

    /// Total number of variables.
    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    /// The variables making up one matrix.
    pub fn matrix_variables(&self, matrix: MatrixId) -> impl Iterator<Item = VariableId> {
        let start = self.matrix_start[matrix.index()];
        let count = self.splits[matrix.index()].len() - 1;
        (start..start + count).map(VariableId)
    }

    /// The matrix a variable belongs to.
    pub fn variable_matrix(&self, variable: VariableId) -> MatrixId {
        let v = variable.index();
        let m = self
            .matrix_start
            .partition_point(|&start| start <= v)
            .saturating_sub(1);
        MatrixId(m)
    }

    /// The variables a submatrix overlaps.
    pub fn submatrix_variables(
        &self,
        computation: &Computation,
        submatrix: SubmatrixId,
    ) -> Result<Vec<VariableId>> {
        let sub = computation.submatrix(submatrix)?;
        let points = &self.splits[sub.matrix.index()];
        let start = self.matrix_start[sub.matrix.index()];
        let begin = sub.col_offset;
        let end = sub.col_offset + sub.num_cols;
        // Submatrix boundaries are split points, so the view covers a whole
        // number of stripes.
        let mut variables = Vec::new();
        for (i, window) in points.windows(2).enumerate() {
            if window[0] >= begin && window[1] <= end {
                variables.push(VariableId(start + i));
            }
        }
        Ok(variables)
    }
}

/// Per-command read/write variable sets.
#[derive(Debug, Default, Clone)]
pub struct CommandAttributes {
    /// Variables read, sorted and deduplicated.
    pub variables_read: Vec<VariableId>,

    /// Variables written, sorted and deduplicated.
    pub variables_written: Vec<VariableId>,
}

/// All accesses touching one matrix, in command order, plus its lifecycle
/// commands and binding flags.
#[derive(Debug, Default, Clone)]
pub struct MatrixAccesses {
    /// Index of the command that allocates this matrix, if any.
    pub allocate_command: Option<usize>,

    /// Index of the command that deallocates this matrix, if any.
    pub deallocate_command: Option<usize>,

    /// Value accesses in command order. The zeroing performed by a zeroed
    /// allocation appears here as a write at the allocation command.
    pub accesses: Vec<Access>,

    /// Matrix is bound as a network input.
    pub is_input: bool,

    /// Matrix is bound as a network output.
    pub is_output: bool,
}

/// Complete access analysis of one computation.
///
/// Invalidated by any structural edit; rebuild with [`Analysis::compute`]
/// before reading it again.
#[derive(Debug)]
pub struct Analysis {
    pub variables: ComputationVariables,

    /// Per submatrix: the variables it overlaps.
    pub submatrix_variables: Vec<Vec<VariableId>>,

    /// Per command: its read/write variable sets.
    pub command_attributes: Vec<CommandAttributes>,

    /// Per variable: its accesses in command order.
    pub variable_accesses: Vec<Vec<Access>>,

    /// Per matrix: lifecycle commands, accesses, and binding flags.
    pub matrix_accesses: Vec<MatrixAccesses>,

    /// Per matrix: the submatrices referencing it.
    pub submatrix_lists: Vec<Vec<SubmatrixId>>,
}

impl Analysis {
    /// Analyze a computation from scratch.
    pub fn compute(computation: &Computation) -> Result<Self> {
        let variables = ComputationVariables::compute(computation)?;

        let mut submatrix_variables = Vec::with_capacity(computation.num_submatrices());
        for s in 0..computation.num_submatrices() {
            submatrix_variables
                .push(variables.submatrix_variables(computation, SubmatrixId(s))?);
        }

        let mut submatrix_lists: Vec<Vec<SubmatrixId>> =
            vec![Vec::new(); computation.num_matrices()];
        for (s, sub) in computation.submatrices.iter().enumerate() {
            submatrix_lists[sub.matrix.index()].push(SubmatrixId(s));
        }

        let mut command_attributes = Vec::with_capacity(computation.commands.len());
        for command in &computation.commands {
            command_attributes.push(Self::attributes_for(
                computation,
                &variables,
                &submatrix_variables,
                command,
            )?);
        }

        let mut variable_accesses: Vec<Vec<Access>> = vec![Vec::new(); variables.num_variables()];
        let mut matrix_accesses: Vec<MatrixAccesses> =
            vec![MatrixAccesses::default(); computation.num_matrices()];

        for (m, accesses) in matrix_accesses.iter_mut().enumerate() {
            accesses.is_input = computation.bindings.is_input(MatrixId(m));
            accesses.is_output = computation.bindings.is_output(MatrixId(m));
        }

        for (c, attr) in command_attributes.iter().enumerate() {
            let mut matrices_read = Vec::new();
            let mut matrices_written = Vec::new();
            for &v in &attr.variables_read {
                let written = attr.variables_written.binary_search(&v).is_ok();
                let kind = if written {
                    AccessKind::ReadWrite
                } else {
                    AccessKind::Read
                };
                variable_accesses[v.index()].push(Access { command: c, kind });
                matrices_read.push(variables.variable_matrix(v));
            }
            for &v in &attr.variables_written {
                matrices_written.push(variables.variable_matrix(v));
                if attr.variables_read.binary_search(&v).is_ok() {
                    continue; // recorded above as ReadWrite
                }
                variable_accesses[v.index()].push(Access {
                    command: c,
                    kind: AccessKind::Write,
                });
            }

            matrices_read.sort_unstable();
            matrices_read.dedup();
            matrices_written.sort_unstable();
            matrices_written.dedup();
            for &m in &matrices_read {
                let written = matrices_written.contains(&m);
                let kind = if written {
                    AccessKind::ReadWrite
                } else {
                    AccessKind::Read
                };
                matrix_accesses[m.index()].push_access(c, kind);
            }
            for &m in &matrices_written {
                if matrices_read.contains(&m) {
                    continue;
                }
                matrix_accesses[m.index()].push_access(c, AccessKind::Write);
            }

            match &computation.commands[c] {
                Command::AllocateMatrix(m) => {
                    matrix_accesses[m.index()].allocate_command = Some(c);
                }
                Command::DeallocateMatrix(m) => {
                    matrix_accesses[m.index()].deallocate_command = Some(c);
                }
                _ => {}
            }
        }

        tracing::trace!(
            num_variables = variables.num_variables(),
            num_commands = computation.commands.len(),
            "access analysis rebuilt"
        );

        Ok(Self {
            variables,
            submatrix_variables,
            command_attributes,
            variable_accesses,
            matrix_accesses,
            submatrix_lists,
        })
    }

    /// Read/write variable sets for one command.
    fn attributes_for(
        computation: &Computation,
        variables: &ComputationVariables,
        submatrix_variables: &[Vec<VariableId>],
        command: &Command,
    ) -> Result<CommandAttributes> {
        let mut attr = CommandAttributes::default();
        let vars_of = |s: &SubmatrixId| submatrix_variables[s.index()].iter().copied();

        match command {
            Command::AllocateMatrix(m) => {
                // A zeroed allocation is the matrix's initializing write; an
                // undefined allocation leaves the contents untouched.
                if computation.matrix(*m)?.init == cantor_core::MatrixInit::Zeroed {
                    attr.variables_written.extend(variables.matrix_variables(*m));
                }
            }
            Command::DeallocateMatrix(_) | Command::NoOp => {}
            Command::Copy { dst, src } => {
                attr.variables_read.extend(vars_of(src));
                attr.variables_written.extend(vars_of(dst));
            }
            Command::Add { dst, src } => {
                attr.variables_read.extend(vars_of(src));
                attr.variables_read.extend(vars_of(dst));
                attr.variables_written.extend(vars_of(dst));
            }
            Command::Scale { dst, .. } => {
                attr.variables_read.extend(vars_of(dst));
                attr.variables_written.extend(vars_of(dst));
            }
            Command::SetConst { dst, .. } => {
                attr.variables_written.extend(vars_of(dst));
            }
            Command::Propagate { input, output, .. } => {
                attr.variables_read.extend(vars_of(input));
                attr.variables_written.extend(vars_of(output));
            }
            Command::Backprop {
                out_value,
                out_deriv,
                in_deriv,
                ..
            } => {
                attr.variables_read.extend(vars_of(out_value));
                attr.variables_read.extend(vars_of(out_deriv));
                attr.variables_written.extend(vars_of(in_deriv));
            }
        }

        attr.variables_read.sort_unstable();
        attr.variables_read.dedup();
        attr.variables_written.sort_unstable();
        attr.variables_written.dedup();
        Ok(attr)
    }
}

impl MatrixAccesses {
    fn push_access(&mut self, command: usize, kind: AccessKind) {
        self.accesses.push(Access { command, kind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantor_core::{MatrixInit, Submatrix};

    #[test]
    fn test_variables_split_at_submatrix_boundaries() {
        let mut c = Computation::new();
        let m = c.add_matrix(4, 10, MatrixInit::Undefined);
        let _whole = c.add_whole_submatrix(m).unwrap();
        let left = c.add_submatrix(Submatrix {
            matrix: m,
            row_offset: 0,
            num_rows: 4,
            col_offset: 0,
            num_cols: 4,
        });
        let right = c.add_submatrix(Submatrix {
            matrix: m,
            row_offset: 0,
            num_rows: 4,
            col_offset: 4,
            num_cols: 6,
        });

        let vars = ComputationVariables::compute(&c).unwrap();
        // Split points 0, 4, 10 give two stripes.
        assert_eq!(vars.num_variables(), 2);
        assert_eq!(
            vars.submatrix_variables(&c, left).unwrap(),
            vec![VariableId(0)]
        );
        assert_eq!(
            vars.submatrix_variables(&c, right).unwrap(),
            vec![VariableId(1)]
        );
        assert_eq!(vars.variable_matrix(VariableId(1)), m);
    }

    #[test]
    fn test_whole_view_covers_all_variables() {
        let mut c = Computation::new();
        let m1 = c.add_matrix(2, 6, MatrixInit::Undefined);
        let m2 = c.add_matrix(2, 6, MatrixInit::Undefined);
        let w1 = c.add_whole_submatrix(m1).unwrap();
        let _part = c.add_submatrix(Submatrix {
            matrix: m1,
            row_offset: 0,
            num_rows: 2,
            col_offset: 2,
            num_cols: 2,
        });
        let w2 = c.add_whole_submatrix(m2).unwrap();

        let vars = ComputationVariables::compute(&c).unwrap();
        // m1 splits at 0, 2, 4, 6; m2 is a single stripe.
        assert_eq!(vars.num_variables(), 4);
        assert_eq!(vars.submatrix_variables(&c, w1).unwrap().len(), 3);
        assert_eq!(vars.submatrix_variables(&c, w2).unwrap().len(), 1);
        assert_eq!(vars.variable_matrix(VariableId(3)), m2);
    }

    #[test]
    fn test_accumulating_write_is_read_write() {
        let mut c = Computation::new();
        let m1 = c.add_matrix(2, 2, MatrixInit::Undefined);
        let m2 = c.add_matrix(2, 2, MatrixInit::Undefined);
        let s1 = c.add_whole_submatrix(m1).unwrap();
        let s2 = c.add_whole_submatrix(m2).unwrap();
        c.commands = vec![
            Command::AllocateMatrix(m1),
            Command::AllocateMatrix(m2),
            Command::Add { dst: s2, src: s1 },
            Command::DeallocateMatrix(m1),
            Command::DeallocateMatrix(m2),
        ];

        let analysis = Analysis::compute(&c).unwrap();
        let m2_accesses = &analysis.matrix_accesses[m2.index()];
        assert_eq!(m2_accesses.accesses.len(), 1);
        assert_eq!(m2_accesses.accesses[0].command, 2);
        assert_eq!(m2_accesses.accesses[0].kind, AccessKind::ReadWrite);
    }

    #[test]
    fn test_zeroed_allocation_is_initializing_write() {
        let mut c = Computation::new();
        let m = c.add_matrix(2, 2, MatrixInit::Zeroed);
        let _s = c.add_whole_submatrix(m).unwrap();
        c.commands = vec![Command::AllocateMatrix(m), Command::DeallocateMatrix(m)];

        let analysis = Analysis::compute(&c).unwrap();
        let accesses = &analysis.matrix_accesses[m.index()];
        assert_eq!(accesses.allocate_command, Some(0));
        assert_eq!(accesses.deallocate_command, Some(1));
        assert_eq!(accesses.accesses.len(), 1);
        assert_eq!(accesses.accesses[0].kind, AccessKind::Write);

        // An undefined allocation writes nothing.
        let mut c2 = c.clone();
        c2.matrices[m.index()].init = MatrixInit::Undefined;
        let analysis2 = Analysis::compute(&c2).unwrap();
        assert!(analysis2.matrix_accesses[m.index()].accesses.is_empty());
    }

    #[test]
    fn test_variable_accesses_in_command_order() {
        let mut c = Computation::new();
        let m1 = c.add_matrix(1, 2, MatrixInit::Undefined);
        let m2 = c.add_matrix(1, 2, MatrixInit::Undefined);
        let s1 = c.add_whole_submatrix(m1).unwrap();
        let s2 = c.add_whole_submatrix(m2).unwrap();
        c.commands = vec![
            Command::AllocateMatrix(m1),
            Command::SetConst { dst: s1, value: 1.0 },
            Command::AllocateMatrix(m2),
            Command::Copy { dst: s2, src: s1 },
            Command::Scale { dst: s2, alpha: 2.0 },
            Command::DeallocateMatrix(m1),
            Command::DeallocateMatrix(m2),
        ];

        let analysis = Analysis::compute(&c).unwrap();
        let v1 = analysis.submatrix_variables[s1.index()][0];
        let kinds: Vec<_> = analysis.variable_accesses[v1.index()]
            .iter()
            .map(|a| (a.command, a.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![(1, AccessKind::Write), (3, AccessKind::Read)]
        );

        let v2 = analysis.submatrix_variables[s2.index()][0];
        let kinds: Vec<_> = analysis.variable_accesses[v2.index()]
            .iter()
            .map(|a| (a.command, a.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![(3, AccessKind::Write), (4, AccessKind::ReadWrite)]
        );
    }

    #[test]
    fn test_submatrix_lists() {
        let mut c = Computation::new();
        let m1 = c.add_matrix(2, 2, MatrixInit::Undefined);
        let m2 = c.add_matrix(2, 2, MatrixInit::Undefined);
        let a = c.add_whole_submatrix(m1).unwrap();
        let b = c.add_whole_submatrix(m2).unwrap();
        let d = c.add_whole_submatrix(m1).unwrap();

        let analysis = Analysis::compute(&c).unwrap();
        assert_eq!(analysis.submatrix_lists[m1.index()], vec![a, d]);
        assert_eq!(analysis.submatrix_lists[m2.index()], vec![b]);
    }
}
