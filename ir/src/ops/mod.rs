//! Graph-construction API.
//!
//! Builders are methods on [`Fusion`]; they register the new expression with it
//! and return the output handle:
//! - `tensor`: fusion input tensors
//! - `arithmetic`: unary, binary and ternary element-wise ops, casts
//! - `reduction`: reductions and Welford
//! - `broadcast`: broadcast along new axes

use fuser_dtype::DataType;

use crate::fusion::Fusion;
use crate::ids::{IterDomainId, ValId};
use crate::iter_domain::IterDomain;
use crate::tensor_view::TensorDomain;
use crate::types::{ConstValue, IterType};

mod arithmetic;
mod broadcast;
mod reduction;
mod tensor;

pub use reduction::WelfordResult;
pub use tensor::SYMBOLIC_SIZE;

/// Anything that can stand as an operand: existing values and host literals.
pub trait IntoVal {
    fn into_val(self, fusion: &mut Fusion) -> ValId;
}

impl IntoVal for ValId {
    fn into_val(self, _fusion: &mut Fusion) -> ValId {
        self
    }
}

impl IntoVal for f64 {
    fn into_val(self, fusion: &mut Fusion) -> ValId {
        fusion.new_const(ConstValue::Float(self))
    }
}

impl IntoVal for i64 {
    fn into_val(self, fusion: &mut Fusion) -> ValId {
        fusion.new_const(ConstValue::Int(self))
    }
}

impl IntoVal for i32 {
    fn into_val(self, fusion: &mut Fusion) -> ValId {
        fusion.new_const(ConstValue::Int(self as i64))
    }
}

impl IntoVal for bool {
    fn into_val(self, fusion: &mut Fusion) -> ValId {
        fusion.new_const(ConstValue::Bool(self))
    }
}

// =========================================================================
// Common helpers
// =========================================================================

impl Fusion {
    pub(crate) fn zero_val(&mut self) -> ValId {
        self.int_val(0)
    }

    pub(crate) fn new_axis(&mut self, extent: ValId, iter_type: IterType) -> IterDomainId {
        let start = self.zero_val();
        self.new_iter_domain(IterDomain::new(start, extent, iter_type))
    }
}

/// Result dtype of an element-wise op over `operands`.
///
/// Tensor dtypes promote among themselves; scalars only lift an integral
/// result to `Float`, they never widen a tensor's floating type.
pub(crate) fn promote_operands(fusion: &Fusion, operands: &[ValId]) -> DataType {
    let tensors: Vec<DataType> = operands.iter().filter(|&&v| fusion.is_tensor(v)).map(|&v| fusion.dtype(v)).collect();
    let scalars = operands.iter().filter(|&&v| !fusion.is_tensor(v)).map(|&v| fusion.dtype(v));
    match tensors.into_iter().reduce(DataType::promote) {
        Some(dtype) => {
            let mut dtype = dtype;
            for scalar in scalars {
                if scalar.is_float() && !dtype.is_float() {
                    dtype = DataType::Float;
                } else if scalar.is_int() && dtype.is_bool() {
                    dtype = DataType::Int64;
                }
            }
            dtype
        }
        None => scalars.reduce(DataType::promote).unwrap_or(DataType::Int64),
    }
}

/// Fresh root domain for the output of an element-wise op over `tensors`.
///
/// Each output axis takes the extent of the first non-broadcast input axis in
/// that position and is a broadcast only when every input is.
pub(crate) fn elementwise_domain(fusion: &mut Fusion, tensors: &[ValId]) -> TensorDomain {
    let roots: Vec<Vec<IterDomainId>> = tensors.iter().map(|&tv| fusion.non_reduction_root(tv)).collect();
    let ndims = roots.first().map_or(0, Vec::len);
    let mut root = Vec::with_capacity(ndims);
    for d in 0..ndims {
        let concrete = roots.iter().map(|r| r[d]).find(|&id| !fusion.id(id).is_broadcast());
        let axis = match concrete {
            Some(id) => {
                let extent = fusion.extent(id);
                fusion.new_axis(extent, IterType::Iteration)
            }
            None => {
                let extent = fusion.extent(roots[0][d]);
                fusion.new_axis(extent, IterType::Broadcast)
            }
        };
        root.push(axis);
    }
    TensorDomain::contiguous(root)
}
