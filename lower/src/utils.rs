//! Small queries over a scheduled fusion shared by the lowering passes.

use fuser_ir::{ExprKind, Fusion, IterDomainId, ParallelTypeSet, ScalarKind, ValId, ValKind};

use crate::compute_at_map::ComputeAtMap;
use crate::kir::Scalar;

/// Kernel arithmetic computing fusion scalar `v`.
pub fn lower_val(fusion: &Fusion, v: ValId) -> Scalar {
    let val = fusion.val(v);
    let dtype = val.dtype();
    match val.kind() {
        ValKind::Scalar(ScalarKind::Const(value)) => Scalar::from_const(*value),
        ValKind::Scalar(ScalarKind::TensorSize { tensor, dim }) => Scalar::TensorSize { tensor: *tensor, dim: *dim },
        ValKind::Scalar(ScalarKind::Symbolic) => {
            let Some(def) = val.definition() else { return Scalar::Input { val: v, dtype } };
            let expr = fusion.expr(def);
            match expr.kind() {
                ExprKind::Unary(op) => Scalar::unary(*op, lower_val(fusion, expr.input(0))),
                ExprKind::Binary(op) => Scalar::binary(*op, lower_val(fusion, expr.input(0)), lower_val(fusion, expr.input(1))),
                ExprKind::Ternary(_) => Scalar::select(
                    lower_val(fusion, expr.input(0)),
                    lower_val(fusion, expr.input(1)),
                    lower_val(fusion, expr.input(2)),
                ),
                _ => Scalar::Input { val: v, dtype },
            }
        }
        ValKind::Tensor(_) => Scalar::Input { val: v, dtype },
    }
}

/// Extent of `id` itself.
pub fn own_extent(fusion: &Fusion, id: IterDomainId) -> Scalar {
    lower_val(fusion, fusion.extent(id))
}

/// Tensor inputs of an expression, deduplicated, in operand order.
pub fn tensor_inputs(fusion: &Fusion, inputs: &[ValId]) -> Vec<ValId> {
    let mut result: Vec<ValId> = Vec::new();
    for &v in inputs {
        if fusion.is_tensor(v) && !result.contains(&v) {
            result.push(v);
        }
    }
    result
}

/// Every id `id` was derived from, nearest first.
pub fn ancestors(fusion: &Fusion, id: IterDomainId) -> Vec<IterDomainId> {
    let mut result = Vec::new();
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
        let Some(def) = fusion.id(current).definition else { continue };
        for input in fusion.transform(def).inputs() {
            if !result.contains(&input) {
                result.push(input);
                stack.push(input);
            }
        }
    }
    result
}

/// Launch types bound to the reduction leaves of `tv`.
pub fn reduced_parallel_types(fusion: &Fusion, ca_map: &ComputeAtMap, tv: ValId) -> ParallelTypeSet {
    fusion
        .tv(tv)
        .domain()
        .leaf()
        .iter()
        .filter(|&&id| fusion.id(id).is_reduction())
        .map(|&id| ca_map.parallel_type(id))
        .filter(|pt| pt.is_launch_dim())
        .collect()
}

/// Index of the first reduction leaf of `tv`.
pub fn first_reduction_leaf(fusion: &Fusion, tv: ValId) -> Option<usize> {
    fusion.tv(tv).domain().leaf().iter().position(|&id| fusion.id(id).is_reduction())
}

/// The tensor whose leaves key an expression's loop nest.
pub fn expr_output(fusion: &Fusion, outputs: &[ValId]) -> Option<ValId> {
    outputs.iter().copied().find(|&v| fusion.is_tensor(v))
}
