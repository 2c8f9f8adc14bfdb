//! Scalar evaluation and structural comparison.

use std::collections::HashMap;

use snafu::ensure;

use crate::error::*;
use crate::expr::ExprKind;
use crate::fusion::Fusion;
use crate::ids::ValId;
use crate::types::{ConstValue, IterType};
use crate::val::{ScalarKind, ValKind};

/// Evaluates scalar values of a fusion under a set of bindings.
pub struct ExpressionEvaluator<'a> {
    fusion: &'a Fusion,
    known: HashMap<ValId, ConstValue>,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(fusion: &'a Fusion) -> Self {
        Self { fusion, known: HashMap::new() }
    }

    pub fn fusion(&self) -> &'a Fusion {
        self.fusion
    }

    pub fn bind(&mut self, v: ValId, value: ConstValue) {
        self.known.insert(v, value);
    }

    /// Bind the root extents of `tv` to concrete sizes.
    ///
    /// Constant extents and previously bound symbolic extents must agree with
    /// the new sizes.
    pub fn bind_tensor_sizes(&mut self, tv: ValId, sizes: &[usize]) -> Result<()> {
        let fusion = self.fusion;
        let root = fusion.non_reduction_root(tv);
        ensure!(
            root.len() == sizes.len(),
            SizeRankMismatchSnafu { tensor: tv, expected: root.len(), actual: sizes.len() }
        );
        for (dim, (&id, &size)) in root.iter().zip(sizes).enumerate() {
            let axis = fusion.id(id);
            let actual = size as i64;
            if axis.iter_type == IterType::Broadcast {
                ensure!(actual == 1, ExtentMismatchSnafu { tensor: tv, dim, expected: 1i64, actual });
                continue;
            }
            match self.evaluate(axis.extent) {
                Some(expected) => {
                    let expected = expected.as_i64();
                    ensure!(expected == actual, ExtentMismatchSnafu { tensor: tv, dim, expected, actual });
                }
                None => self.bind(axis.extent, ConstValue::Int(actual)),
            }
        }
        Ok(())
    }

    pub fn evaluate(&mut self, v: ValId) -> Option<ConstValue> {
        if let Some(&value) = self.known.get(&v) {
            return Some(value);
        }
        let fusion = self.fusion;
        let val = fusion.val(v);
        let value = match val.kind() {
            ValKind::Scalar(ScalarKind::Const(value)) => *value,
            ValKind::Scalar(_) => {
                let def = fusion.expr(val.definition()?);
                let integral = !val.dtype().is_float();
                match def.kind() {
                    ExprKind::Unary(op) => {
                        let x = self.evaluate(def.input(0))?;
                        ConstValue::from_f64(op.eval(x.as_f64()), val.dtype())
                    }
                    ExprKind::Binary(op) => {
                        let a = self.evaluate(def.input(0))?;
                        let b = self.evaluate(def.input(1))?;
                        match (a, b) {
                            (ConstValue::Int(a), ConstValue::Int(b)) if integral => int_binary(*op, a, b)?,
                            _ => ConstValue::from_f64(op.eval(a.as_f64(), b.as_f64(), integral), val.dtype()),
                        }
                    }
                    ExprKind::Ternary(_) => {
                        let cond = self.evaluate(def.input(0))?;
                        let pick = if cond.as_bool() { def.input(1) } else { def.input(2) };
                        self.evaluate(pick)?
                    }
                    _ => return None,
                }
            }
            ValKind::Tensor(_) => return None,
        };
        self.known.insert(v, value);
        Some(value)
    }

    pub fn evaluate_int(&mut self, v: ValId) -> Option<i64> {
        self.evaluate(v).map(|value| value.as_i64())
    }
}

/// Exact integer arithmetic for extents; avoids `f64` rounding on large sizes.
pub(crate) fn int_binary(op: crate::types::BinaryOpType, a: i64, b: i64) -> Option<ConstValue> {
    use crate::types::BinaryOpType::*;
    let value = match op {
        Add => a.checked_add(b)?,
        Sub => a.checked_sub(b)?,
        Mul => a.checked_mul(b)?,
        Div => a.checked_div(b)?,
        Mod => a.checked_rem(b)?,
        CeilDiv => {
            if b == 0 {
                return None;
            }
            (a + b - 1).div_euclid(b)
        }
        Max => a.max(b),
        Min => a.min(b),
        _ => return Some(ConstValue::Bool(op.eval(a as f64, b as f64, true) != 0.0)),
    };
    Some(ConstValue::Int(value))
}

/// Fold `v` to an integer if it only depends on constants.
pub fn const_int(fusion: &Fusion, v: ValId) -> Option<i64> {
    ExpressionEvaluator::new(fusion).evaluate_int(v)
}

/// Whether two scalars are provably the same value.
///
/// Identical handles, equal constants, or the same scalar expression over
/// structurally equal operands.
pub fn same_scalar(fusion: &Fusion, a: ValId, b: ValId) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (const_int(fusion, a), const_int(fusion, b)) {
        return x == y;
    }
    let (Some(da), Some(db)) = (fusion.definition(a), fusion.definition(b)) else { return false };
    let (ea, eb) = (fusion.expr(da), fusion.expr(db));
    ea.kind() == eb.kind()
        && ea.inputs().len() == eb.inputs().len()
        && ea.inputs().iter().zip(eb.inputs()).all(|(&x, &y)| same_scalar(fusion, x, y))
}
