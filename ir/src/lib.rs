//! Intermediate representation for the fusion compiler.
//!
//! A [`Fusion`] is an arena holding a dataflow graph of scalar and tensor
//! values. Each tensor carries its own iteration schedule (a
//! [`TensorDomain`]) that the scheduling crate rewrites and lowering turns
//! into loop nests.
//!
//! # Module Organization
//!
//! - [`ids`] - Stable arena handles
//! - [`types`] - Constant values, operation kinds, iteration, parallel and memory types
//! - [`val`], [`expr`] - Graph nodes
//! - [`iter_domain`], [`tensor_view`] - Per-tensor iteration spaces
//! - [`fusion`] - The arena and graph traversal
//! - [`ops`] - Graph-construction builders
//! - [`evaluator`] - Scalar evaluation under bound sizes
//! - [`printer`] - Text dumps of a fusion
//! - [`error`] - Error types and result handling

pub mod error;
pub mod evaluator;
pub mod expr;
pub mod fusion;
pub mod guard;
pub mod ids;
pub mod iter_domain;
pub mod ops;
pub mod printer;
pub mod tensor_view;
pub mod types;
pub mod val;

#[cfg(test)]
pub mod test;

pub use error::{Error, Result, normalize_axis};
pub use evaluator::{ExpressionEvaluator, const_int, same_scalar};
pub use expr::{Expr, ExprKind};
pub use fusion::Fusion;
pub use guard::FusionGuard;
pub use ids::{ExprId, IterDomainId, TransformId, ValId};
pub use iter_domain::{IdTransform, IterDomain};
pub use ops::{IntoVal, SYMBOLIC_SIZE, WelfordResult};
pub use tensor_view::{TensorDomain, TensorView};
pub use types::{
    BinaryOpType, ConstValue, IterType, MemoryType, ParallelType, ParallelTypeSet, TernaryOpType, UnaryOpType,
};
pub use val::{ScalarKind, Val, ValKind};

pub use fuser_dtype::DataType;
