//! Lowering a scheduled fusion to kernel IR.
//!
//! Lowering groups iteration domains that share a loop, orders the fusion's
//! expressions into a loop nest, decides where every buffer lives, and
//! emits index arithmetic and guards for each element operation. The result
//! is a [`Kernel`] that code generation prints and the host interpreter
//! runs directly.
//!
//! # Module Organization
//!
//! - [`compute_at_map`] - loop groups across tensors
//! - [`parallel_dims`] - launch extents per parallel type
//! - [`thread_predicate`] - launch types a value is only valid along index zero
//! - [`validation`] - parallelization and vectorization checks
//! - [`loop_nest`] - ordering expressions into a loop tree
//! - [`index`], [`predicate`] - index arithmetic and guards
//! - [`kernel_builder`] - emitting the loop nest as kernel IR
//! - [`alloc`], [`sync`] - storage layout and block barriers
//! - [`gpu_lower`] - the pipeline
//! - [`kir`] - the kernel IR itself

pub mod alloc;
pub mod compute_at_map;
pub mod error;
pub mod gpu_lower;
pub mod index;
pub mod kernel_builder;
pub mod kir;
pub mod loop_nest;
pub mod parallel_dims;
pub mod predicate;
pub mod sync;
pub mod thread_predicate;
pub mod utils;
pub mod validation;

#[cfg(test)]
pub mod test;

pub use compute_at_map::ComputeAtMap;
pub use error::{LowerError, Result};
pub use gpu_lower::{GpuLower, lower};
pub use kir::{
    Allocate, Collective, ForLoop, GridReductionInfo, IfThenElse, Kernel, KernelParam, KernelSummary, LoopId, Op,
    Operand, Scalar, ScalarEnv, SharedBuffer, Stmt, TensorIndex, TensorRole, VectorizedAccess, WelfordInput,
    WelfordTriple,
};
pub use parallel_dims::{ParallelDim, ParallelDimensionMap};
pub use thread_predicate::ThreadPredicateMap;
