//! The computation model: matrices, submatrix views, and the command sequence.
//!
//! A `Computation` is the low-level program the compiler emits for one
//! utterance: a flat table of allocatable matrices, a table of rectangular
//! views into them (submatrices), and a single ordered command sequence.
//! Position in that sequence is the only notion of time — there is no
//! concurrency at this level.
//!
//! Matrices and submatrices are addressed by stable integer handles into
//! their tables. The optimizer mutates all three tables in place; cleanup
//! passes renumber the handles and rewrite every reference through the
//! generic argument-slot enumeration on `Command`.

use crate::network::Network;
use crate::{Error, Result};

/// Handle for a matrix in `Computation::matrices`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatrixId(pub usize);

impl MatrixId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Handle for a submatrix in `Computation::submatrices`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmatrixId(pub usize);

impl SubmatrixId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Handle for a component in `Network::components`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(pub usize);

impl ComponentId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// How a matrix's contents are initialized at its allocation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixInit {
    /// Storage is zero-filled on allocation.
    Zeroed,

    /// Storage contents are undefined until the first write.
    Undefined,
}

/// An allocatable numeric buffer.
///
/// The liveness window of a matrix is implied by its allocate/deallocate
/// commands; matrices bound as computation outputs have no deallocation and
/// stay live for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixInfo {
    pub rows: usize,
    pub cols: usize,
    pub init: MatrixInit,
}

/// A rectangular view into exactly one matrix.
///
/// Multiple submatrices may reference the same matrix, and after a merge
/// duplicate views (same matrix, same range) can exist until cleanup
/// deduplicates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Submatrix {
    pub matrix: MatrixId,
    pub row_offset: usize,
    pub num_rows: usize,
    pub col_offset: usize,
    pub num_cols: usize,
}

/// One instruction in the command sequence.
///
/// Only `Copy`, `Propagate`, and `Backprop` can trigger a merge; the other
/// kinds matter to the optimizer solely through their read/write sets and
/// their matrix/submatrix argument slots.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Allocate storage for a matrix (zeroed or undefined per its `MatrixInit`).
    AllocateMatrix(MatrixId),

    /// Release a matrix's storage. Output matrices are never deallocated.
    DeallocateMatrix(MatrixId),

    /// `dst = src` (same view shape).
    Copy { dst: SubmatrixId, src: SubmatrixId },

    /// `dst += src` (accumulating write).
    Add { dst: SubmatrixId, src: SubmatrixId },

    /// `dst *= alpha`.
    Scale { dst: SubmatrixId, alpha: f32 },

    /// `dst[..] = value`.
    SetConst { dst: SubmatrixId, value: f32 },

    /// Forward pass of `component`: reads `input`, sets `output`.
    Propagate {
        component: ComponentId,
        input: SubmatrixId,
        output: SubmatrixId,
    },

    /// Backward pass of `component`: reads the forward `out_value` and
    /// `out_deriv`, sets `in_deriv`.
    Backprop {
        component: ComponentId,
        out_value: SubmatrixId,
        out_deriv: SubmatrixId,
        in_deriv: SubmatrixId,
    },

    /// Placeholder left behind by the optimizer; removed by cleanup.
    NoOp,
}

impl Command {
    /// The submatrix-typed argument slots of this command.
    pub fn submatrix_args(&self) -> Vec<SubmatrixId> {
        match self {
            Command::AllocateMatrix(_) | Command::DeallocateMatrix(_) | Command::NoOp => vec![],
            Command::Copy { dst, src } | Command::Add { dst, src } => vec![*dst, *src],
            Command::Scale { dst, .. } | Command::SetConst { dst, .. } => vec![*dst],
            Command::Propagate { input, output, .. } => vec![*input, *output],
            Command::Backprop {
                out_value,
                out_deriv,
                in_deriv,
                ..
            } => vec![*out_value, *out_deriv, *in_deriv],
        }
    }

    /// Mutable references to the submatrix-typed argument slots.
    ///
    /// This is the generic rewrite surface used by renumbering: callers can
    /// remap every submatrix reference without per-kind special-casing.
    pub fn submatrix_args_mut(&mut self) -> Vec<&mut SubmatrixId> {
        match self {
            Command::AllocateMatrix(_) | Command::DeallocateMatrix(_) | Command::NoOp => vec![],
            Command::Copy { dst, src } | Command::Add { dst, src } => vec![dst, src],
            Command::Scale { dst, .. } | Command::SetConst { dst, .. } => vec![dst],
            Command::Propagate { input, output, .. } => vec![input, output],
            Command::Backprop {
                out_value,
                out_deriv,
                in_deriv,
                ..
            } => vec![out_value, out_deriv, in_deriv],
        }
    }

    /// The matrix-typed argument slots of this command.
    ///
    /// Only allocation and deallocation commands reference matrices directly.
    pub fn matrix_args(&self) -> Vec<MatrixId> {
        match self {
            Command::AllocateMatrix(m) | Command::DeallocateMatrix(m) => vec![*m],
            _ => vec![],
        }
    }

    /// Mutable references to the matrix-typed argument slots.
    pub fn matrix_args_mut(&mut self) -> Vec<&mut MatrixId> {
        match self {
            Command::AllocateMatrix(m) | Command::DeallocateMatrix(m) => vec![m],
            _ => vec![],
        }
    }

    /// Check whether this command is a no-op placeholder.
    pub fn is_no_op(&self) -> bool {
        matches!(self, Command::NoOp)
    }
}

// ─────────────────────────────── IoBindings ───────────────────────────────

/// Mapping from named network inputs/outputs to matrices.
///
/// Input matrices are filled by the caller logically before the computation
/// starts; output matrices stay live after the last command so the caller
/// can read them back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoBindings {
    inputs: Vec<(String, MatrixId)>,
    outputs: Vec<(String, MatrixId)>,
}

impl IoBindings {
    /// Create an empty binding table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a named network input to a matrix.
    pub fn bind_input(&mut self, name: impl Into<String>, matrix: MatrixId) {
        self.inputs.push((name.into(), matrix));
    }

    /// Bind a named network output to a matrix.
    pub fn bind_output(&mut self, name: impl Into<String>, matrix: MatrixId) {
        self.outputs.push((name.into(), matrix));
    }

    /// Check whether a matrix is bound as an input.
    pub fn is_input(&self, matrix: MatrixId) -> bool {
        self.inputs.iter().any(|(_, m)| *m == matrix)
    }

    /// Check whether a matrix is bound as an output.
    pub fn is_output(&self, matrix: MatrixId) -> bool {
        self.outputs.iter().any(|(_, m)| *m == matrix)
    }

    /// Iterate over `(name, matrix)` input bindings.
    pub fn inputs(&self) -> impl Iterator<Item = (&str, MatrixId)> {
        self.inputs.iter().map(|(n, m)| (n.as_str(), *m))
    }

    /// Iterate over `(name, matrix)` output bindings.
    pub fn outputs(&self) -> impl Iterator<Item = (&str, MatrixId)> {
        self.outputs.iter().map(|(n, m)| (n.as_str(), *m))
    }

    /// Look up the matrix bound to a named input.
    pub fn input_matrix(&self, name: &str) -> Option<MatrixId> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| *m)
    }

    /// Look up the matrix bound to a named output.
    pub fn output_matrix(&self, name: &str) -> Option<MatrixId> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| *m)
    }

    /// Wherever `old` appears as an output binding, rebind it to `new`.
    ///
    /// Returns `true` if a binding was rewritten. Used by the merge executor
    /// when the merged-away matrix carried an output binding.
    pub fn replace_output(&mut self, old: MatrixId, new: MatrixId) -> bool {
        let mut replaced = false;
        for (_, m) in self.outputs.iter_mut() {
            if *m == old {
                *m = new;
                replaced = true;
            }
        }
        replaced
    }

    /// Apply a matrix renumbering to every binding.
    pub fn remap_matrices(&mut self, map: impl Fn(MatrixId) -> MatrixId) {
        for (_, m) in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            *m = map(*m);
        }
    }
}

// ─────────────────────────────── Computation ──────────────────────────────

/// A compiled computation: matrix and submatrix tables plus the ordered
/// command sequence and the input/output binding table.
#[derive(Debug, Clone, PartialEq)]
pub struct Computation {
    pub matrices: Vec<MatrixInfo>,
    pub submatrices: Vec<Submatrix>,
    pub commands: Vec<Command>,
    pub bindings: IoBindings,
}

impl Computation {
    /// Create an empty computation.
    pub fn new() -> Self {
        Self {
            matrices: Vec::new(),
            submatrices: Vec::new(),
            commands: Vec::new(),
            bindings: IoBindings::new(),
        }
    }

    /// Add a matrix to the table and return its handle.
    pub fn add_matrix(&mut self, rows: usize, cols: usize, init: MatrixInit) -> MatrixId {
        let id = MatrixId(self.matrices.len());
        self.matrices.push(MatrixInfo { rows, cols, init });
        id
    }

    /// Add a submatrix view to the table and return its handle.
    pub fn add_submatrix(&mut self, submatrix: Submatrix) -> SubmatrixId {
        let id = SubmatrixId(self.submatrices.len());
        self.submatrices.push(submatrix);
        id
    }

    /// Add a view covering the whole of `matrix`.
    pub fn add_whole_submatrix(&mut self, matrix: MatrixId) -> Result<SubmatrixId> {
        let info = self.matrix(matrix)?;
        let (num_rows, num_cols) = (info.rows, info.cols);
        Ok(self.add_submatrix(Submatrix {
            matrix,
            row_offset: 0,
            num_rows,
            col_offset: 0,
            num_cols,
        }))
    }

    /// Get a matrix by handle.
    pub fn matrix(&self, id: MatrixId) -> Result<&MatrixInfo> {
        self.matrices
            .get(id.index())
            .ok_or(Error::MatrixNotFound(id.index()))
    }

    /// Get a submatrix by handle.
    pub fn submatrix(&self, id: SubmatrixId) -> Result<&Submatrix> {
        self.submatrices
            .get(id.index())
            .ok_or(Error::SubmatrixNotFound(id.index()))
    }

    /// Get the parent matrix of a submatrix.
    pub fn submatrix_matrix(&self, id: SubmatrixId) -> Result<MatrixId> {
        Ok(self.submatrix(id)?.matrix)
    }

    /// Check whether a submatrix covers the whole of its parent matrix.
    ///
    /// Whole views are the only shape eligible for merging.
    pub fn is_whole_submatrix(&self, id: SubmatrixId) -> Result<bool> {
        let sub = self.submatrix(id)?;
        let info = self.matrix(sub.matrix)?;
        Ok(sub.row_offset == 0
            && sub.col_offset == 0
            && sub.num_rows == info.rows
            && sub.num_cols == info.cols)
    }

    /// Number of matrices in the table (including any merged-away orphans
    /// that cleanup has not yet removed).
    pub fn num_matrices(&self) -> usize {
        self.matrices.len()
    }

    /// Number of submatrices in the table.
    pub fn num_submatrices(&self) -> usize {
        self.submatrices.len()
    }

    /// Defensive consistency check.
    ///
    /// The optimizer assumes its input already satisfies these invariants; a
    /// violation means the IR is malformed and cannot be safely executed, so
    /// callers treat the error as fatal.
    ///
    /// Checked here:
    /// - every submatrix references an existing matrix and stays in bounds,
    /// - every command argument (submatrix, matrix, component) resolves,
    /// - every matrix is allocated exactly once,
    /// - every non-output matrix is deallocated exactly once, after its
    ///   allocation; output matrices are never deallocated,
    /// - the binding table references existing matrices.
    pub fn check(&self, network: &Network) -> Result<()> {
        for (i, sub) in self.submatrices.iter().enumerate() {
            let info = self.matrix(sub.matrix).map_err(|_| {
                Error::InvalidComputation(format!(
                    "submatrix {} references nonexistent matrix {}",
                    i,
                    sub.matrix.index()
                ))
            })?;
            if sub.num_rows == 0
                || sub.num_cols == 0
                || sub.row_offset + sub.num_rows > info.rows
                || sub.col_offset + sub.num_cols > info.cols
            {
                return Err(Error::InvalidComputation(format!(
                    "submatrix {} out of bounds for matrix {} ({}x{})",
                    i,
                    sub.matrix.index(),
                    info.rows,
                    info.cols
                )));
            }
        }

        let mut alloc_count = vec![0usize; self.matrices.len()];
        let mut dealloc_count = vec![0usize; self.matrices.len()];
        let mut alloc_pos = vec![usize::MAX; self.matrices.len()];
        for (c, command) in self.commands.iter().enumerate() {
            for s in command.submatrix_args() {
                self.submatrix(s).map_err(|_| {
                    Error::InvalidComputation(format!(
                        "command {} references nonexistent submatrix {}",
                        c,
                        s.index()
                    ))
                })?;
            }
            for m in command.matrix_args() {
                self.matrix(m).map_err(|_| {
                    Error::InvalidComputation(format!(
                        "command {} references nonexistent matrix {}",
                        c,
                        m.index()
                    ))
                })?;
            }
            match command {
                Command::AllocateMatrix(m) => {
                    alloc_count[m.index()] += 1;
                    alloc_pos[m.index()] = c;
                }
                Command::DeallocateMatrix(m) => {
                    dealloc_count[m.index()] += 1;
                    if alloc_pos[m.index()] == usize::MAX || alloc_pos[m.index()] > c {
                        return Err(Error::InvalidComputation(format!(
                            "matrix {} deallocated at command {} before its allocation",
                            m.index(),
                            c
                        )));
                    }
                }
                Command::Propagate { component, .. } | Command::Backprop { component, .. } => {
                    network.component(*component)?;
                }
                _ => {}
            }
        }
        for m in 0..self.matrices.len() {
            // Matrices merged away earlier in the pipeline may survive with no
            // references until cleanup runs; they carry no commands at all.
            if alloc_count[m] == 0 && dealloc_count[m] == 0 {
                let referenced = self.submatrices.iter().any(|s| s.matrix.index() == m);
                if !referenced {
                    continue;
                }
            }
            if alloc_count[m] != 1 {
                return Err(Error::InvalidComputation(format!(
                    "matrix {} allocated {} times",
                    m, alloc_count[m]
                )));
            }
            let is_output = self.bindings.is_output(MatrixId(m));
            let expected_deallocs = if is_output { 0 } else { 1 };
            if dealloc_count[m] != expected_deallocs {
                return Err(Error::InvalidComputation(format!(
                    "matrix {} deallocated {} times (expected {})",
                    m, dealloc_count[m], expected_deallocs
                )));
            }
        }

        for (name, m) in self.bindings.inputs().chain(self.bindings.outputs()) {
            self.matrix(m).map_err(|_| {
                Error::InvalidComputation(format!(
                    "binding '{}' references nonexistent matrix {}",
                    name,
                    m.index()
                ))
            })?;
        }

        Ok(())
    }
}

impl Default for Computation {
    fn default() -> Self {
        Self::new()
    }
}
