//! Cache insertion and memory placement.

use fuser_ir::{ExprKind, Fusion, MemoryType, TensorDomain, UnaryOpType, ValId};
use snafu::ensure;
use tracing::debug;

use crate::domain::fresh_axis;
use crate::error::*;

/// Insert a copy between `tv` and all of its current uses; returns the copy.
pub(crate) fn cache_after(fusion: &mut Fusion, tv: ValId) -> Result<ValId> {
    fusion.ensure_tensor(tv)?;
    ensure!(fusion.tv(tv).fixed_position() == 0, InvalidCacheSnafu { tv, reason: "it already has a compute-at position" });
    let uses = fusion.uses(tv).to_vec();
    let cache = fusion.set(tv)?;
    for e in uses {
        fusion.replace_expr_input(e, tv, cache);
    }
    debug!(%tv, %cache, "cache_after");
    Ok(cache)
}

/// Make the computation of `tv` write into a new producer that `tv` then
/// copies from; returns the producer.
///
/// The producer takes over `tv`'s domain and schedule; `tv` gets a fresh,
/// unscheduled domain.
pub(crate) fn cache_before(fusion: &mut Fusion, tv: ValId) -> Result<ValId> {
    fusion.ensure_tensor(tv)?;
    let Some(def) = fusion.definition(tv) else {
        return InvalidCacheSnafu { tv, reason: "it has no definition" }.fail();
    };
    ensure!(fusion.tv(tv).fixed_position() == 0, InvalidCacheSnafu { tv, reason: "it already has a compute-at position" });
    ensure!(fusion.siblings(tv).is_empty(), InvalidCacheSnafu { tv, reason: "multi-output expressions cannot be cached" });

    let domain = fusion.tv(tv).domain().clone();
    let cache = fusion.new_tensor(domain, fusion.dtype(tv));
    fusion.replace_expr_output(def, tv, cache);

    let mut root = Vec::new();
    for id in fusion.non_reduction_root(cache) {
        let iter_type = fusion.id(id).iter_type;
        root.push(fresh_axis(fusion, id, iter_type));
    }
    fusion.tv_mut(tv).set_domain(TensorDomain::contiguous(root));
    fusion.register_expr(ExprKind::Unary(UnaryOpType::Set), vec![cache], vec![tv]);
    debug!(%tv, %cache, "cache_before");
    Ok(cache)
}

/// Give an output that has other uses a dedicated copy and make the copy the
/// fusion output; returns the copy.
pub(crate) fn cache_fork(fusion: &mut Fusion, tv: ValId) -> Result<ValId> {
    fusion.ensure_tensor(tv)?;
    ensure!(fusion.is_output(tv), InvalidCacheSnafu { tv, reason: "only fusion outputs can be forked" });
    ensure!(!fusion.uses(tv).is_empty(), InvalidCacheSnafu { tv, reason: "the output has no other uses" });
    let fork = fusion.set(tv)?;
    fusion.replace_output(tv, fork);
    debug!(%tv, %fork, "cache_fork");
    Ok(fork)
}

pub(crate) fn set_memory_type(fusion: &mut Fusion, tv: ValId, memory_type: MemoryType) -> Result<()> {
    fusion.ensure_tensor(tv)?;
    let io = fusion.is_input(tv) || fusion.is_output(tv);
    ensure!(
        !io || memory_type == MemoryType::Global,
        InvalidMemoryTypeSnafu { tv, memory_type, reason: "fusion inputs and outputs live in global memory" }
    );
    fusion.tv_mut(tv).set_memory_type(memory_type);
    fusion.sync_siblings(tv);
    Ok(())
}
