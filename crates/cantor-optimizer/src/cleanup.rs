//! Graph cleanup: renumbering, orphan removal, and no-op elimination.
//!
//! Merging leaves debris behind: duplicate submatrix views, matrices with no
//! remaining references, and no-op placeholder commands. The passes here
//! remove it. Both passes are idempotent, independently invokable, and apply
//! their renumberings as explicit remap tables in a single rewrite step over
//! every command, submatrix, and binding.

use std::collections::HashMap;

use cantor_core::{Computation, Error, MatrixId, Result, Submatrix, SubmatrixId};

/// Remove matrices with no referencing submatrices, deduplicating submatrix
/// views along the way.
///
/// Submatrices with identical (matrix, range) collapse to the first
/// occurrence; every command argument referencing a removed duplicate is
/// rewritten to the survivor. Matrices still referenced by a command or a
/// binding are kept even without views, so a half-cleaned graph never gains
/// dangling references.
pub fn remove_orphan_matrices(computation: &mut Computation) -> Result<()> {
    // Deduplicate submatrix views.
    let mut canonical: HashMap<Submatrix, SubmatrixId> = HashMap::new();
    let mut submatrix_remap: Vec<SubmatrixId> = Vec::with_capacity(computation.num_submatrices());
    let mut kept_submatrices: Vec<Submatrix> = Vec::new();
    for sub in &computation.submatrices {
        let id = *canonical.entry(sub.clone()).or_insert_with(|| {
            let id = SubmatrixId(kept_submatrices.len());
            kept_submatrices.push(sub.clone());
            id
        });
        submatrix_remap.push(id);
    }

    for command in &mut computation.commands {
        for slot in command.submatrix_args_mut() {
            *slot = *submatrix_remap
                .get(slot.index())
                .ok_or(Error::SubmatrixNotFound(slot.index()))?;
        }
    }
    computation.submatrices = kept_submatrices;

    // Find matrices that are still referenced anywhere.
    let mut used = vec![false; computation.num_matrices()];
    for sub in &computation.submatrices {
        *used
            .get_mut(sub.matrix.index())
            .ok_or(Error::MatrixNotFound(sub.matrix.index()))? = true;
    }
    for command in &computation.commands {
        for m in command.matrix_args() {
            *used
                .get_mut(m.index())
                .ok_or(Error::MatrixNotFound(m.index()))? = true;
        }
    }
    for (_, m) in computation
        .bindings
        .inputs()
        .chain(computation.bindings.outputs())
    {
        *used
            .get_mut(m.index())
            .ok_or(Error::MatrixNotFound(m.index()))? = true;
    }

    // Renumber the survivors contiguously and rewrite every reference.
    let mut matrix_remap: Vec<Option<MatrixId>> = vec![None; computation.num_matrices()];
    let mut next = 0;
    for (m, &keep) in used.iter().enumerate() {
        if keep {
            matrix_remap[m] = Some(MatrixId(next));
            next += 1;
        }
    }
    if next == computation.num_matrices() {
        return Ok(()); // nothing orphaned, numbering already contiguous
    }

    let remap = |m: MatrixId| matrix_remap[m.index()].expect("remap of a used matrix");
    let mut kept_matrices = Vec::with_capacity(next);
    for (m, info) in computation.matrices.iter().enumerate() {
        if used[m] {
            kept_matrices.push(info.clone());
        }
    }
    computation.matrices = kept_matrices;
    for sub in &mut computation.submatrices {
        sub.matrix = remap(sub.matrix);
    }
    for command in &mut computation.commands {
        for slot in command.matrix_args_mut() {
            *slot = remap(*slot);
        }
    }
    computation.bindings.remap_matrices(remap);

    tracing::debug!(
        removed = matrix_remap.iter().filter(|r| r.is_none()).count(),
        remaining = next,
        "removed orphan matrices"
    );
    Ok(())
}

/// Delete every no-op command from the sequence.
///
/// Command indices held elsewhere (analysis structures, merge bookkeeping)
/// are invalid afterwards and must not be dereferenced.
pub fn remove_no_ops(computation: &mut Computation) {
    computation.commands.retain(|command| !command.is_no_op());
}
