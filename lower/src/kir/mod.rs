//! Kernel IR: the loop-nest program lowering produces.
//!
//! A [`Kernel`] owns a tree of [`Stmt`]s (loops, conditionals, allocations,
//! barriers and element operations) over [`Scalar`] index arithmetic, plus
//! the parameter list and [`KernelSummary`] a launcher needs. Tensors keep
//! the [`ValId`] they had in the fusion; nothing here refers back to
//! iteration domains except for diagnostics.

pub mod printer;
pub mod scalar;

use fuser_ir::{BinaryOpType, ConstValue, DataType, IterDomainId, MemoryType, ParallelType, ParallelTypeSet, UnaryOpType, ValId};

pub use scalar::{LoopId, Scalar, ScalarEnv};

use crate::parallel_dims::ParallelDimensionMap;

/// An element of a tensor, addressed in its own storage.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorIndex {
    pub tv: ValId,
    pub dtype: DataType,
    pub index: Scalar,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Tensor(TensorIndex),
    Scalar { value: Scalar, dtype: DataType },
}

impl Operand {
    pub fn dtype(&self) -> DataType {
        match self {
            Operand::Tensor(t) => t.dtype,
            Operand::Scalar { dtype, .. } => *dtype,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorIndex> {
        match self {
            Operand::Tensor(t) => Some(t),
            Operand::Scalar { .. } => None,
        }
    }
}

/// How a reduction or broadcast is carried out across threads.
#[derive(Debug, Clone, PartialEq)]
pub enum Collective {
    /// Each thread works on its own elements.
    Serial,
    /// Threads of a block cooperate over the parallel types in `types`.
    Block { types: ParallelTypeSet, read_pred: Scalar, write_pred: Scalar },
    /// Blocks of the grid cooperate; `types` holds every reduced type, block
    /// and thread alike.
    Grid { types: ParallelTypeSet, read_pred: Scalar, write_pred: Scalar },
}

impl Collective {
    pub fn is_serial(&self) -> bool {
        matches!(self, Collective::Serial)
    }

    pub fn types(&self) -> ParallelTypeSet {
        match self {
            Collective::Serial => ParallelTypeSet::empty(),
            Collective::Block { types, .. } | Collective::Grid { types, .. } => *types,
        }
    }
}

/// Running statistics of a Welford reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct WelfordTriple {
    pub avg: TensorIndex,
    pub var_sum: TensorIndex,
    pub n: TensorIndex,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WelfordInput {
    /// One new sample per element.
    Sample(Operand),
    /// Partial statistics of an earlier stage.
    Partial { avg: Operand, var_sum: Operand, n: Operand },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Unary { op: UnaryOpType, out: TensorIndex, input: Operand },
    Binary { op: BinaryOpType, out: TensorIndex, lhs: Operand, rhs: Operand },
    Where { out: TensorIndex, cond: Operand, a: Operand, b: Operand },
    /// First value of a reduction result, written before its reduction loops.
    Init { out: TensorIndex, value: ConstValue },
    Reduction { op: BinaryOpType, out: TensorIndex, input: Operand, init: ConstValue, collective: Collective },
    Welford { out: WelfordTriple, input: WelfordInput, collective: Collective },
    Broadcast { out: TensorIndex, input: Operand, collective: Collective },
}

impl Op {
    /// Tensors this op writes.
    pub fn outputs(&self) -> Vec<&TensorIndex> {
        match self {
            Op::Unary { out, .. }
            | Op::Binary { out, .. }
            | Op::Where { out, .. }
            | Op::Init { out, .. }
            | Op::Reduction { out, .. }
            | Op::Broadcast { out, .. } => vec![out],
            Op::Welford { out, .. } => vec![&out.avg, &out.var_sum, &out.n],
        }
    }

    /// Operands this op reads, tensors and scalars alike.
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Op::Unary { input, .. } | Op::Reduction { input, .. } | Op::Broadcast { input, .. } => vec![input],
            Op::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Where { cond, a, b, .. } => vec![cond, a, b],
            Op::Init { .. } => Vec::new(),
            Op::Welford { input: WelfordInput::Sample(x), .. } => vec![x],
            Op::Welford { input: WelfordInput::Partial { avg, var_sum, n }, .. } => vec![avg, var_sum, n],
        }
    }

    /// Tensors this op reads. Serial reductions also read their output.
    pub fn inputs(&self) -> Vec<&TensorIndex> {
        let mut inputs: Vec<&TensorIndex> = self.operands().into_iter().filter_map(Operand::as_tensor).collect();
        match self {
            Op::Reduction { out, collective: Collective::Serial, .. } => inputs.push(out),
            Op::Welford { out, collective: Collective::Serial, .. } => inputs.extend([&out.avg, &out.var_sum, &out.n]),
            _ => {}
        }
        inputs
    }

    pub fn collective(&self) -> Option<&Collective> {
        match self {
            Op::Reduction { collective, .. } | Op::Welford { collective, .. } | Op::Broadcast { collective, .. } => {
                Some(collective)
            }
            _ => None,
        }
    }

    /// Block and grid collectives synchronize the block internally.
    pub fn synchronizes(&self) -> bool {
        self.collective().is_some_and(|c| !c.is_serial())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForLoop {
    pub index: LoopId,
    pub extent: Scalar,
    pub parallel: ParallelType,
    /// Concrete axis of the loop group, for diagnostics.
    pub iter_domain: IterDomainId,
    pub body: Vec<Stmt>,
}

impl ForLoop {
    /// Value of the loop index as seen by the body.
    pub fn index_value(&self) -> Scalar {
        if self.parallel.is_launch_dim() { Scalar::ParallelIndex(self.parallel) } else { Scalar::Loop(self.index) }
    }

    /// Launch-bound loops are implied by the launch and emit no loop.
    pub fn is_trivial(&self) -> bool {
        self.parallel.is_launch_dim()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfThenElse {
    pub cond: Scalar,
    pub then_body: Vec<Stmt>,
    pub else_body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Allocate {
    pub tv: ValId,
    pub memory: MemoryType,
    pub dtype: DataType,
    /// Number of elements.
    pub size: Scalar,
    /// Shared buffer whose storage this one reuses.
    pub alias: Option<ValId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    For(ForLoop),
    If(IfThenElse),
    Allocate(Allocate),
    /// Block-wide barrier; `war` marks barriers protecting a write after a read.
    Sync { war: bool },
    Op(Op),
}

impl Stmt {
    /// Visit every statement in pre-order.
    pub fn walk<'a>(stmts: &'a [Stmt], f: &mut impl FnMut(&'a Stmt)) {
        for stmt in stmts {
            f(stmt);
            match stmt {
                Stmt::For(l) => Stmt::walk(&l.body, f),
                Stmt::If(i) => {
                    Stmt::walk(&i.then_body, f);
                    Stmt::walk(&i.else_body, f);
                }
                _ => {}
            }
        }
    }

    /// Every op in pre-order.
    pub fn ops(stmts: &[Stmt]) -> Vec<&Op> {
        let mut ops = Vec::new();
        Stmt::walk(stmts, &mut |s| {
            if let Stmt::Op(op) = s {
                ops.push(op);
            }
        });
        ops
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    Input,
    Output,
    /// A fusion intermediate that lives in global memory.
    Intermediate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelParam {
    Tensor {
        tv: ValId,
        dtype: DataType,
        role: TensorRole,
        /// Extent of each non-reduction root axis.
        sizes: Vec<Scalar>,
    },
    Scalar { val: ValId, dtype: DataType },
    /// Per-block partial results of the grid reduction.
    WorkBuffer { dtype: DataType },
    /// Arrival counters of the grid reduction, one per reduction segment.
    SyncFlags,
}

/// A vectorized access the launcher must check strides and alignment for.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorizedAccess {
    /// The global tensor read or written with vector loads.
    pub tv: ValId,
    pub width: usize,
    /// Misaligned accesses only need unit inner stride.
    pub misaligned: bool,
    /// Innermost root axes merged into the vectorized axis; they must be
    /// contiguous with a total extent divisible by `width`.
    pub merged_dims: usize,
}

/// A shared-memory buffer and where it sits in dynamic shared memory.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedBuffer {
    pub tv: ValId,
    pub dtype: DataType,
    pub size: Scalar,
    /// Byte offset into the dynamic shared memory array.
    pub offset: Scalar,
    pub alias: Option<ValId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridReductionInfo {
    pub dtype: DataType,
    /// Values reduced per element: one, or three for Welford.
    pub values: usize,
    pub types: ParallelTypeSet,
}

/// Facts about a kernel a launcher needs without walking its body.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSummary {
    pub parallel_dims: ParallelDimensionMap,
    pub has_block_reduction: bool,
    pub has_block_broadcast: bool,
    pub has_grid_broadcast: bool,
    pub has_welford: bool,
    pub grid_reduction: Option<GridReductionInfo>,
    pub vectorized: Vec<VectorizedAccess>,
    pub shared: Vec<SharedBuffer>,
    /// Bytes of static buffers in dynamic shared memory.
    pub shared_bytes: Scalar,
    /// Bytes per thread of the block reduction and broadcast workspace.
    pub workspace_elem_bytes: usize,
}

impl KernelSummary {
    pub fn needs_workspace(&self) -> bool {
        self.has_block_reduction || self.has_block_broadcast || self.grid_reduction.is_some() || self.has_grid_broadcast
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub name: String,
    pub params: Vec<KernelParam>,
    pub body: Vec<Stmt>,
    pub summary: KernelSummary,
}

impl Kernel {
    pub fn ops(&self) -> Vec<&Op> {
        Stmt::ops(&self.body)
    }

    pub fn tensor_params(&self) -> impl Iterator<Item = (ValId, DataType, TensorRole, &[Scalar])> {
        self.params.iter().filter_map(|p| match p {
            KernelParam::Tensor { tv, dtype, role, sizes } => Some((*tv, *dtype, *role, sizes.as_slice())),
            _ => None,
        })
    }

    pub fn allocations(&self) -> Vec<&Allocate> {
        let mut allocations = Vec::new();
        Stmt::walk(&self.body, &mut |s| {
            if let Stmt::Allocate(a) = s {
                allocations.push(a);
            }
        });
        allocations
    }
}
