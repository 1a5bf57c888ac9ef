//! Reference executor for computations.
//!
//! A straight-line interpreter over the command sequence, used to validate
//! that graph transformations preserve semantics. It is deliberately naive:
//! every view is gathered into a contiguous buffer before a kernel runs, so
//! aliased operands (the point of in-place merging) behave exactly like
//! separate ones.
//!
//! Liveness bugs are made loud: `Undefined` allocations are NaN-filled, so a
//! read of never-written storage poisons the output, and deallocated storage
//! is dropped, so a use-after-deallocate fails with an error.

use std::collections::HashMap;

use crate::computation::{Command, Computation, MatrixId, SubmatrixId};
use crate::network::Network;
use crate::{Error, MatrixInit, Result};

/// Interprets a computation over per-matrix f32 storage.
pub struct Executor<'a> {
    network: &'a Network,
    computation: &'a Computation,
    storage: Vec<Option<Vec<f32>>>,
    inputs: HashMap<String, Vec<f32>>,
}

impl<'a> Executor<'a> {
    /// Create an executor for one computation.
    pub fn new(network: &'a Network, computation: &'a Computation) -> Self {
        Self {
            network,
            computation,
            storage: vec![None; computation.num_matrices()],
            inputs: HashMap::new(),
        }
    }

    /// Provide the value of a named network input.
    ///
    /// The value is copied into the input's matrix when its allocation
    /// command runs; the caller-visible contract is that inputs are filled
    /// before any computation reads them.
    pub fn set_input(&mut self, name: impl Into<String>, values: Vec<f32>) -> &mut Self {
        self.inputs.insert(name.into(), values);
        self
    }

    /// Run the command sequence and return the named output values.
    pub fn run(&mut self) -> Result<HashMap<String, Vec<f32>>> {
        self.storage = vec![None; self.computation.num_matrices()];

        for (index, command) in self.computation.commands.iter().enumerate() {
            self.execute(index, command)?;
        }

        let mut outputs = HashMap::new();
        for (name, matrix) in self.computation.bindings.outputs() {
            let values = self.storage[matrix.index()].clone().ok_or_else(|| {
                Error::Execution(format!(
                    "output '{}' (matrix {}) is not live at end of computation",
                    name,
                    matrix.index()
                ))
            })?;
            outputs.insert(name.to_string(), values);
        }
        Ok(outputs)
    }

    fn execute(&mut self, index: usize, command: &Command) -> Result<()> {
        match command {
            Command::AllocateMatrix(m) => self.allocate(*m),
            Command::DeallocateMatrix(m) => {
                if self.storage[m.index()].take().is_none() {
                    return Err(Error::Execution(format!(
                        "command {}: matrix {} deallocated while not live",
                        index,
                        m.index()
                    )));
                }
                Ok(())
            }
            Command::Copy { dst, src } => {
                let values = self.read_view(*src)?;
                self.write_view(*dst, &values)
            }
            Command::Add { dst, src } => {
                let src_values = self.read_view(*src)?;
                let mut dst_values = self.read_view(*dst)?;
                for (d, s) in dst_values.iter_mut().zip(&src_values) {
                    *d += s;
                }
                self.write_view(*dst, &dst_values)
            }
            Command::Scale { dst, alpha } => {
                let mut values = self.read_view(*dst)?;
                for v in values.iter_mut() {
                    *v *= alpha;
                }
                self.write_view(*dst, &values)
            }
            Command::SetConst { dst, value } => {
                let len = self.view_len(*dst)?;
                self.write_view(*dst, &vec![*value; len])
            }
            Command::Propagate {
                component,
                input,
                output,
            } => {
                let component = self.network.component(*component)?;
                let cols = self.computation.submatrix(*input)?.num_cols;
                let in_values = self.read_view(*input)?;
                let mut out_values = vec![0.0; self.view_len(*output)?];
                if in_values.len() != out_values.len() {
                    return Err(Error::Execution(format!(
                        "command {}: propagate operand shapes differ",
                        index
                    )));
                }
                component.propagate(cols, &in_values, &mut out_values);
                self.write_view(*output, &out_values)
            }
            Command::Backprop {
                component,
                out_value,
                out_deriv,
                in_deriv,
            } => {
                let component = self.network.component(*component)?;
                let cols = self.computation.submatrix(*out_deriv)?.num_cols;
                let y = self.read_view(*out_value)?;
                let dy = self.read_view(*out_deriv)?;
                let mut dx = vec![0.0; self.view_len(*in_deriv)?];
                if y.len() != dy.len() || dy.len() != dx.len() {
                    return Err(Error::Execution(format!(
                        "command {}: backprop operand shapes differ",
                        index
                    )));
                }
                component.backprop(cols, &y, &dy, &mut dx);
                self.write_view(*in_deriv, &dx)
            }
            Command::NoOp => Ok(()),
        }
    }

    fn allocate(&mut self, m: MatrixId) -> Result<()> {
        let info = self.computation.matrix(m)?;
        let fill = match info.init {
            MatrixInit::Zeroed => 0.0,
            MatrixInit::Undefined => f32::NAN,
        };
        self.storage[m.index()] = Some(vec![fill; info.rows * info.cols]);

        // Input matrices receive their caller-provided values as soon as
        // their storage exists.
        for (name, matrix) in self.computation.bindings.inputs() {
            if matrix == m {
                let values = self.inputs.get(name).ok_or_else(|| {
                    Error::Execution(format!("no value provided for input '{}'", name))
                })?;
                if values.len() != info.rows * info.cols {
                    return Err(Error::Execution(format!(
                        "input '{}' has {} values, expected {}",
                        name,
                        values.len(),
                        info.rows * info.cols
                    )));
                }
                self.storage[m.index()] = Some(values.clone());
            }
        }
        Ok(())
    }

    fn view_len(&self, s: SubmatrixId) -> Result<usize> {
        let sub = self.computation.submatrix(s)?;
        Ok(sub.num_rows * sub.num_cols)
    }

    /// Gather a view into a contiguous row-major buffer.
    fn read_view(&self, s: SubmatrixId) -> Result<Vec<f32>> {
        let sub = self.computation.submatrix(s)?;
        let info = self.computation.matrix(sub.matrix)?;
        let data = self.storage[sub.matrix.index()].as_ref().ok_or_else(|| {
            Error::Execution(format!(
                "read of submatrix {} while matrix {} is not live",
                s.index(),
                sub.matrix.index()
            ))
        })?;
        let mut out = Vec::with_capacity(sub.num_rows * sub.num_cols);
        for r in 0..sub.num_rows {
            let start = (sub.row_offset + r) * info.cols + sub.col_offset;
            out.extend_from_slice(&data[start..start + sub.num_cols]);
        }
        Ok(out)
    }

    /// Scatter a contiguous row-major buffer back into a view.
    fn write_view(&mut self, s: SubmatrixId, values: &[f32]) -> Result<()> {
        let sub = self.computation.submatrix(s)?.clone();
        let info = self.computation.matrix(sub.matrix)?.clone();
        if values.len() != sub.num_rows * sub.num_cols {
            return Err(Error::Execution(format!(
                "write of {} values into submatrix {} of size {}",
                values.len(),
                s.index(),
                sub.num_rows * sub.num_cols
            )));
        }
        let data = self.storage[sub.matrix.index()].as_mut().ok_or_else(|| {
            Error::Execution(format!(
                "write to submatrix {} while matrix {} is not live",
                s.index(),
                sub.matrix.index()
            ))
        })?;
        for r in 0..sub.num_rows {
            let start = (sub.row_offset + r) * info.cols + sub.col_offset;
            data[start..start + sub.num_cols]
                .copy_from_slice(&values[r * sub.num_cols..(r + 1) * sub.num_cols]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::computation::{MatrixInit, Submatrix};

    #[test]
    fn test_copy_chain() {
        let mut c = Computation::new();
        let m_in = c.add_matrix(2, 2, MatrixInit::Undefined);
        let m_out = c.add_matrix(2, 2, MatrixInit::Undefined);
        let s_in = c.add_whole_submatrix(m_in).unwrap();
        let s_out = c.add_whole_submatrix(m_out).unwrap();
        c.bindings.bind_input("in", m_in);
        c.bindings.bind_output("out", m_out);
        c.commands = vec![
            Command::AllocateMatrix(m_in),
            Command::AllocateMatrix(m_out),
            Command::Copy {
                dst: s_out,
                src: s_in,
            },
            Command::DeallocateMatrix(m_in),
        ];

        let network = Network::new();
        let outputs = Executor::new(&network, &c)
            .set_input("in", vec![1.0, 2.0, 3.0, 4.0])
            .run()
            .unwrap();
        assert_eq!(outputs["out"], vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_propagate_through_component() {
        let mut network = Network::new();
        let scale = network.add_component(Component::Scale(3.0));

        let mut c = Computation::new();
        let m_in = c.add_matrix(1, 3, MatrixInit::Undefined);
        let m_out = c.add_matrix(1, 3, MatrixInit::Undefined);
        let s_in = c.add_whole_submatrix(m_in).unwrap();
        let s_out = c.add_whole_submatrix(m_out).unwrap();
        c.bindings.bind_input("in", m_in);
        c.bindings.bind_output("out", m_out);
        c.commands = vec![
            Command::AllocateMatrix(m_in),
            Command::AllocateMatrix(m_out),
            Command::Propagate {
                component: scale,
                input: s_in,
                output: s_out,
            },
            Command::DeallocateMatrix(m_in),
        ];

        let outputs = Executor::new(&network, &c)
            .set_input("in", vec![1.0, 2.0, 3.0])
            .run()
            .unwrap();
        assert_eq!(outputs["out"], vec![3.0, 6.0, 9.0]);
    }

    #[test]
    fn test_partial_view_write() {
        // Write a constant into the right half of a zeroed matrix.
        let mut c = Computation::new();
        let m = c.add_matrix(2, 4, MatrixInit::Zeroed);
        let right = c.add_submatrix(Submatrix {
            matrix: m,
            row_offset: 0,
            num_rows: 2,
            col_offset: 2,
            num_cols: 2,
        });
        c.bindings.bind_output("out", m);
        c.commands = vec![
            Command::AllocateMatrix(m),
            Command::SetConst {
                dst: right,
                value: 5.0,
            },
        ];

        let network = Network::new();
        let outputs = Executor::new(&network, &c).run().unwrap();
        assert_eq!(outputs["out"], vec![0.0, 0.0, 5.0, 5.0, 0.0, 0.0, 5.0, 5.0]);
    }

    #[test]
    fn test_read_after_deallocate_fails() {
        let mut c = Computation::new();
        let m = c.add_matrix(1, 1, MatrixInit::Zeroed);
        let s = c.add_whole_submatrix(m).unwrap();
        c.commands = vec![
            Command::AllocateMatrix(m),
            Command::DeallocateMatrix(m),
            Command::Scale { dst: s, alpha: 2.0 },
        ];

        let network = Network::new();
        assert!(Executor::new(&network, &c).run().is_err());
    }

    #[test]
    fn test_missing_input_fails() {
        let mut c = Computation::new();
        let m = c.add_matrix(1, 1, MatrixInit::Zeroed);
        c.bindings.bind_input("in", m);
        c.commands = vec![Command::AllocateMatrix(m)];

        let network = Network::new();
        assert!(Executor::new(&network, &c).run().is_err());
    }
}
