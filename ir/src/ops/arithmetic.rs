//! Element-wise operations: unary math, binary arithmetic and comparisons,
//! `where` and casts.
//!
//! Operands may be tensors, scalar values or host literals. Tensor operands
//! must agree on rank; broadcast axes are resolved against the first
//! concrete input axis in the same position. An op over constant scalars
//! folds to a new constant instead of registering an expression.

use fuser_dtype::DataType;
use snafu::ensure;

use super::{IntoVal, elementwise_domain, promote_operands};
use crate::error::*;
use crate::evaluator::int_binary;
use crate::expr::ExprKind;
use crate::fusion::Fusion;
use crate::ids::ValId;
use crate::types::{BinaryOpType, ConstValue, TernaryOpType, UnaryOpType};

macro_rules! unary_ops {
    ($($method:ident => $op:ident),+ $(,)?) => {
        impl Fusion {
            $(
                #[doc = concat!("Element-wise `", stringify!($method), "`.")]
                pub fn $method(&mut self, x: impl IntoVal) -> Result<ValId> {
                    self.unary_op(UnaryOpType::$op, x)
                }
            )+
        }
    };
}

macro_rules! binary_ops {
    ($($method:ident => $op:ident),+ $(,)?) => {
        impl Fusion {
            $(
                #[doc = concat!("Element-wise `", stringify!($op), "` with type promotion.")]
                pub fn $method(&mut self, lhs: impl IntoVal, rhs: impl IntoVal) -> Result<ValId> {
                    self.binary_op(BinaryOpType::$op, lhs, rhs)
                }
            )+
        }
    };
}

unary_ops! {
    neg => Neg,
    abs => Abs,
    exp => Exp,
    log => Log,
    sqrt => Sqrt,
    rsqrt => Rsqrt,
    reciprocal => Reciprocal,
    relu => Relu,
    sigmoid => Sigmoid,
    tanh => Tanh,
}

binary_ops! {
    add => Add,
    sub => Sub,
    mul => Mul,
    div => Div,
    rem => Mod,
    ceil_div => CeilDiv,
    maximum => Max,
    minimum => Min,
    lt => Lt,
    le => Le,
    gt => Gt,
    ge => Ge,
    eq => Eq,
    ne => Ne,
    logical_and => And,
    logical_or => Or,
}

impl Fusion {
    /// Apply `op` element-wise. Float-only ops lift integral inputs to `Float`.
    pub fn unary_op(&mut self, op: UnaryOpType, x: impl IntoVal) -> Result<ValId> {
        let x = x.into_val(self);
        let input = self.dtype(x);
        let dtype = if op.is_float_only() && !input.is_float() { DataType::Float } else { input };
        ensure!(
            !(input.is_bool() && matches!(op, UnaryOpType::Neg | UnaryOpType::Abs)),
            InvalidDTypeSnafu { op: "unary arithmetic", dtype: input }
        );
        if let Some(value) = self.as_const(x) {
            return Ok(self.new_const_typed(ConstValue::from_f64(op.eval(value.as_f64()), dtype), dtype));
        }
        self.elementwise(ExprKind::Unary(op), vec![x], dtype)
    }

    /// Copy of `x`, the identity op used for caches and explicit copies.
    pub fn set(&mut self, x: impl IntoVal) -> Result<ValId> {
        let x = x.into_val(self);
        let dtype = self.dtype(x);
        self.elementwise(ExprKind::Unary(UnaryOpType::Set), vec![x], dtype)
    }

    /// Convert `x` to `dtype`; a no-op cast still produces a new value.
    pub fn cast(&mut self, x: impl IntoVal, dtype: DataType) -> Result<ValId> {
        let x = x.into_val(self);
        if let Some(value) = self.as_const(x) {
            return Ok(self.new_const_typed(value, dtype));
        }
        self.elementwise(ExprKind::Unary(UnaryOpType::Cast), vec![x], dtype)
    }

    pub fn binary_op(&mut self, op: BinaryOpType, lhs: impl IntoVal, rhs: impl IntoVal) -> Result<ValId> {
        let lhs = lhs.into_val(self);
        let rhs = rhs.into_val(self);
        let operand_type = promote_operands(self, &[lhs, rhs]);
        let dtype = if op.is_comparison() || op.is_logical() { DataType::Bool } else { operand_type };
        if op == BinaryOpType::CeilDiv {
            ensure!(operand_type.is_int(), InvalidDTypeSnafu { op: "ceil_div", dtype: operand_type });
        }
        if let (Some(a), Some(b)) = (self.as_const(lhs), self.as_const(rhs))
            && let Some(value) = fold_binary(op, a, b, operand_type)
        {
            return Ok(self.new_const_typed(value, dtype));
        }
        self.elementwise(ExprKind::Binary(op), vec![lhs, rhs], dtype)
    }

    /// `cond ? a : b`, element-wise.
    pub fn where_(&mut self, cond: impl IntoVal, a: impl IntoVal, b: impl IntoVal) -> Result<ValId> {
        let cond = cond.into_val(self);
        let a = a.into_val(self);
        let b = b.into_val(self);
        ensure!(self.dtype(cond).is_bool(), InvalidDTypeSnafu { op: "where", dtype: self.dtype(cond) });
        let dtype = promote_operands(self, &[a, b]);
        if let Some(flag) = self.as_const(cond)
            && !self.is_tensor(a)
            && !self.is_tensor(b)
        {
            let pick = if flag.as_bool() { a } else { b };
            if let Some(value) = self.as_const(pick) {
                return Ok(self.new_const_typed(value, dtype));
            }
        }
        self.elementwise(ExprKind::Ternary(TernaryOpType::Where), vec![cond, a, b], dtype)
    }

    /// Register an element-wise expression over `operands`.
    ///
    /// Scalar-only expressions produce a scalar. Otherwise the output is a
    /// fresh tensor whose root follows [`elementwise_domain`].
    fn elementwise(&mut self, kind: ExprKind, operands: Vec<ValId>, dtype: DataType) -> Result<ValId> {
        let tensors: Vec<ValId> = operands.iter().copied().filter(|&v| self.is_tensor(v)).collect();
        let out = match tensors.first() {
            None => self.new_scalar(dtype),
            Some(&first) => {
                let rank = self.non_reduction_root(first).len();
                for &tv in &tensors[1..] {
                    let actual = self.non_reduction_root(tv).len();
                    ensure!(actual == rank, RankMismatchSnafu { op: kind.name(), expected: rank, actual });
                }
                let domain = elementwise_domain(self, &tensors);
                self.new_tensor(domain, dtype)
            }
        };
        self.register_expr(kind, operands, vec![out]);
        Ok(out)
    }
}

fn fold_binary(op: BinaryOpType, a: ConstValue, b: ConstValue, operand_type: DataType) -> Option<ConstValue> {
    match (a, b) {
        (ConstValue::Int(a), ConstValue::Int(b)) if operand_type.is_int() => int_binary(op, a, b),
        _ => {
            let integral = !operand_type.is_float();
            let value = op.eval(a.as_f64(), b.as_f64(), integral);
            Some(ConstValue::from_f64(value, operand_type))
        }
    }
}
