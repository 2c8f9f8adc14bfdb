//! Generic kernel execution interface.

use fuser_codegen::RenderedKernel;
use fuser_dtype::DataType;
use fuser_ir::{ConstValue, ParallelType, ValId};
use fuser_lower::Kernel;

use crate::Result;

/// Grid, block and dynamic shared memory of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_mem_bytes: u32,
}

impl LaunchDims {
    pub fn blocks(&self) -> u64 {
        self.grid.iter().map(|&d| d as u64).product()
    }

    pub fn threads_per_block(&self) -> u64 {
        self.block.iter().map(|&d| d as u64).product()
    }

    pub fn threads(&self) -> u64 {
        self.blocks() * self.threads_per_block()
    }

    /// Launch extent bound to `pt`; one for non-launch types.
    pub fn extent(&self, pt: ParallelType) -> u32 {
        match pt.launch_slot() {
            Some(slot @ 0..3) => self.grid[slot],
            Some(slot) => self.block[slot - 3],
            None => 1,
        }
    }
}

/// A tensor kernel argument addressing host buffer `buffer`.
///
/// Several arguments share a buffer when an output is written into an input.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorArg {
    pub tv: ValId,
    pub buffer: usize,
    pub dtype: DataType,
    pub sizes: Vec<usize>,
    pub strides: Vec<i64>,
}

/// One kernel argument, in the order of the kernel's parameter list.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Tensor(TensorArg),
    Scalar { val: ValId, dtype: DataType, value: ConstValue },
    /// Zero-filled scratch for grid collectives.
    WorkBuffer { dtype: DataType, elements: usize },
    /// Zero-filled arrival counters of grid collectives.
    SyncFlags { elements: usize },
}

/// A compiled kernel ready for execution.
///
/// Arguments reach the kernel through host buffers: each backend moves
/// them wherever the kernel runs and writes results back before returning.
pub trait CompiledKernel: Send + Sync {
    fn launch(&self, dims: &LaunchDims, args: &[ArgValue], buffers: &mut [Vec<f64>]) -> Result<()>;

    /// Get the kernel name for debugging/profiling.
    fn name(&self) -> &str;
}

/// Turns lowered kernels into executables.
pub trait KernelBackend: Send + Sync {
    /// Backend identifier, part of the module cache key.
    fn name(&self) -> &str;

    fn compile(&self, kernel: &Kernel, rendered: &RenderedKernel) -> Result<Box<dyn CompiledKernel>>;
}
