//! Which threads hold valid values of each tensor.
//!
//! A block or grid reduction leaves its result only in the threads whose
//! reduced indices are zero. Consumers inherit that restriction until a
//! broadcast along the reduced types spreads the value back to every thread,
//! which makes the broadcast a block or grid broadcast.

use std::collections::HashMap;

use fuser_ir::{ExprId, ExprKind, Fusion, ParallelType, ParallelTypeSet, ValId};
use tracing::trace;

use crate::compute_at_map::ComputeAtMap;
use crate::kir::Scalar;
use crate::utils::{reduced_parallel_types, tensor_inputs};

#[derive(Debug, Clone, Default)]
pub struct ThreadPredicateMap {
    /// Types along which only index zero holds the value.
    valid_at_zero: HashMap<ValId, ParallelTypeSet>,
    /// Types an expression must restrict to index zero.
    expr_types: HashMap<ExprId, ParallelTypeSet>,
    /// Types a broadcast spreads across.
    broadcast_types: HashMap<ExprId, ParallelTypeSet>,
}

impl ThreadPredicateMap {
    pub fn build(fusion: &Fusion, ca_map: &ComputeAtMap) -> Self {
        let mut map = Self::default();
        for e in fusion.tensor_exprs() {
            let expr = fusion.expr(e);
            let mut inherited = ParallelTypeSet::empty();
            for input in tensor_inputs(fusion, expr.inputs()) {
                inherited |= map.get(input);
            }
            map.expr_types.insert(e, inherited);

            let mut produced = inherited;
            if let ExprKind::Broadcast { is_broadcast_dim } = expr.kind() {
                let out = expr.output(0);
                let spread = broadcast_leaf_types(fusion, ca_map, out, is_broadcast_dim) & inherited;
                if !spread.is_empty() {
                    trace!(%out, ?spread, "parallel broadcast");
                    map.broadcast_types.insert(e, spread);
                }
                produced -= spread;
            }
            for &out in expr.outputs() {
                if !fusion.is_tensor(out) {
                    continue;
                }
                let reduced = if expr.kind().is_reduction() {
                    reduced_parallel_types(fusion, ca_map, out)
                } else {
                    ParallelTypeSet::empty()
                };
                map.valid_at_zero.insert(out, produced | reduced);
            }
        }
        map
    }

    pub fn get(&self, tv: ValId) -> ParallelTypeSet {
        self.valid_at_zero.get(&tv).copied().unwrap_or_default()
    }

    pub fn expr_types(&self, e: ExprId) -> ParallelTypeSet {
        self.expr_types.get(&e).copied().unwrap_or_default()
    }

    pub fn broadcast_types(&self, e: ExprId) -> ParallelTypeSet {
        self.broadcast_types.get(&e).copied().unwrap_or_default()
    }

    /// `pt == 0` for every type in `types`, in launch order.
    pub fn predicate(types: ParallelTypeSet) -> Scalar {
        Scalar::all(
            ParallelType::LAUNCH_TYPES
                .into_iter()
                .filter(|pt| types.contains(*pt))
                .map(|pt| Scalar::ParallelIndex(pt).eq(Scalar::ZERO)),
        )
    }
}

/// Launch types bound to leaves of `out` derived from its new broadcast axes.
fn broadcast_leaf_types(fusion: &Fusion, ca_map: &ComputeAtMap, out: ValId, is_broadcast_dim: &[bool]) -> ParallelTypeSet {
    let domain = fusion.tv(out).domain();
    let new_axes: Vec<_> = domain.root().iter().zip(is_broadcast_dim).filter(|&(_, &b)| b).map(|(&id, _)| id).collect();
    let mut types = ParallelTypeSet::empty();
    for &leaf in domain.leaf() {
        let derived = new_axes.contains(&leaf) || crate::utils::ancestors(fusion, leaf).iter().any(|a| new_axes.contains(a));
        let pt = ca_map.parallel_type(leaf);
        if derived && pt.is_launch_dim() {
            types |= pt;
        }
    }
    types
}
