//! Types for code generation.

use fuser_ir::{DataType, ValId};
use fuser_lower::{KernelParam, TensorRole};

/// A rendered kernel ready for compilation and execution.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedKernel {
    /// The generated CUDA C++ source, prelude included.
    pub code: String,

    /// Entry point function name.
    pub entry_point: String,

    /// Launch arguments in signature order.
    pub args: Vec<KernelArg>,
}

/// One argument of a rendered kernel's signature.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelArg {
    /// Parameter name in the generated source.
    pub name: String,
    pub kind: ArgKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A `Tensor<T, N>` struct: data pointer, then `N` sizes and `N` strides.
    Tensor { tv: ValId, dtype: DataType, ndims: usize, role: TensorRole },
    Scalar { val: ValId, dtype: DataType },
    /// Raw pointer to the grid work buffer.
    WorkBuffer { dtype: DataType },
    /// Raw pointer to zero-initialized `int64_t` arrival counters.
    SyncFlags,
}

impl KernelArg {
    pub fn from_param(param: &KernelParam) -> Self {
        match param {
            KernelParam::Tensor { tv, dtype, role, sizes } => Self {
                name: format!("T{}", tv.index()),
                kind: ArgKind::Tensor { tv: *tv, dtype: *dtype, ndims: sizes.len(), role: *role },
            },
            KernelParam::Scalar { val, dtype } => {
                Self { name: format!("s{}", val.index()), kind: ArgKind::Scalar { val: *val, dtype: *dtype } }
            }
            KernelParam::WorkBuffer { dtype } => Self { name: "work_buf".to_string(), kind: ArgKind::WorkBuffer { dtype: *dtype } },
            KernelParam::SyncFlags => Self { name: "sync_flags".to_string(), kind: ArgKind::SyncFlags },
        }
    }
}

impl RenderedKernel {
    pub fn new(code: String, entry_point: String) -> Self {
        Self { code, entry_point, args: Vec::new() }
    }

    /// Tensor arguments with their roles.
    pub fn tensor_args(&self) -> impl Iterator<Item = (ValId, DataType, usize, TensorRole)> + '_ {
        self.args.iter().filter_map(|a| match a.kind {
            ArgKind::Tensor { tv, dtype, ndims, role } => Some((tv, dtype, ndims, role)),
            _ => None,
        })
    }
}
