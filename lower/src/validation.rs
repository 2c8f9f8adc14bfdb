//! Schedule checks that only make sense once loops are known.

use std::collections::HashSet;

use fuser_ir::{ExprKind, Fusion, IdTransform, IterDomainId, MemoryType, ParallelType, UnaryOpType, ValId};
use fuser_schedule::{PairwiseRootDomainMap, best_effort_map};
use snafu::ensure;
use tracing::debug;

use crate::compute_at_map::ComputeAtMap;
use crate::error::*;
use crate::index::memory_of;
use crate::kir::VectorizedAccess;
use crate::utils::{reduced_parallel_types, tensor_inputs};

/// Each launch type binds at most one leaf of a tensor.
pub fn validate_leaf_bindings(fusion: &Fusion, ca_map: &ComputeAtMap) -> Result<()> {
    for tv in fusion.all_tensors() {
        let mut seen = HashSet::new();
        for &leaf in fusion.tv(tv).domain().leaf() {
            let pt = ca_map.parallel_type(leaf);
            if pt.is_launch_dim() && !fusion.id(leaf).is_broadcast() && !seen.insert(pt) {
                return UnsupportedSnafu { reason: format!("{tv} binds {pt} to more than one axis") }.fail();
            }
        }
    }
    Ok(())
}

/// A thread-bound producer axis must be bound the same way in its consumer
/// unless the producer is visible to the other threads.
///
/// Registers are private to a thread, so a local producer needs every
/// thread-bound axis matched; shared memory is private to a block, so a
/// local or shared producer needs every block-bound axis matched.
pub fn validate_parallelization(fusion: &Fusion, ca_map: &ComputeAtMap) -> Result<()> {
    for e in fusion.tensor_exprs() {
        let expr = fusion.expr(e);
        for producer in tensor_inputs(fusion, expr.inputs()) {
            let memory = memory_of(fusion, producer);
            if memory == MemoryType::Global {
                continue;
            }
            for &consumer in expr.outputs() {
                if !fusion.is_tensor(consumer) {
                    continue;
                }
                let root_map = PairwiseRootDomainMap::new(fusion, producer, consumer)?;
                let map = best_effort_map(fusion, producer, consumer, root_map.pairs());
                let consumer_leaf = fusion.tv(consumer).domain().leaf();
                for &leaf in fusion.tv(producer).domain().leaf() {
                    let id = fusion.id(leaf);
                    let pt = ca_map.parallel_type(leaf);
                    if id.is_reduction() || id.is_broadcast() || !pt.is_launch_dim() {
                        continue;
                    }
                    let required = if pt.is_thread_dim() { MemoryType::Shared } else { MemoryType::Global };
                    if memory >= required {
                        continue;
                    }
                    let matched = consumer_leaf.iter().any(|&c| {
                        ca_map.parallel_type(c) == pt && (ca_map.same_loop(leaf, c) || map.get(&leaf) == Some(&c))
                    });
                    ensure!(matched, ParallelMismatchSnafu { producer, consumer, parallel: pt, required });
                }
            }
        }
    }
    Ok(())
}

/// A kernel performs at most one grid reduction.
pub fn validate_grid_reductions(fusion: &Fusion, ca_map: &ComputeAtMap) -> Result<()> {
    let count = fusion
        .tensor_exprs()
        .into_iter()
        .filter(|&e| {
            let expr = fusion.expr(e);
            expr.kind().is_reduction()
                && reduced_parallel_types(fusion, ca_map, expr.output(0)).iter().any(ParallelType::is_block_dim)
        })
        .count();
    ensure!(count <= 1, MultipleGridReductionsSnafu { count });
    Ok(())
}

/// Check every vectorized axis and report the global accesses it vectorizes.
pub fn validate_vectorization(fusion: &Fusion, ca_map: &ComputeAtMap) -> Result<Vec<VectorizedAccess>> {
    let mut accesses = Vec::new();
    for tv in fusion.all_tensors() {
        let leaf = fusion.tv(tv).domain().leaf();
        let Some(pos) = leaf.iter().position(|&id| ca_map.parallel_type(id).is_vectorize()) else { continue };
        let vector_id = leaf[pos];
        let misaligned = ca_map.parallel_type(vector_id) == ParallelType::MisalignedVectorize;
        ensure!(pos + 1 == leaf.len(), InvalidVectorizeSnafu { tv, reason: "only the innermost axis can be vectorized" });

        let width = fuser_ir::const_int(fusion, fusion.extent(vector_id));
        let Some(width) = width.filter(|&w| w > 0) else {
            return InvalidVectorizeSnafu { tv, reason: "vector width must be a constant" }.fail();
        };
        let width = width as usize;
        let bytes = fusion.dtype(tv).bytes();
        ensure!(
            width.is_power_of_two() && width * bytes <= 16,
            InvalidVectorizeSnafu { tv, reason: "vector width must be a power of two of at most 16 bytes" }
        );

        let Some(def) = fusion.definition(tv) else {
            return InvalidVectorizeSnafu { tv, reason: "fusion inputs cannot be vectorized" }.fail();
        };
        let expr = fusion.expr(def);
        ensure!(
            matches!(expr.kind(), ExprKind::Unary(UnaryOpType::Set)),
            InvalidVectorizeSnafu { tv, reason: "only set operations can be vectorized" }
        );

        let merged_dims = vectorized_root_dims(fusion, tv, vector_id)?;
        let input = expr.input(0);
        for global in [input, tv] {
            if fusion.is_tensor(global) && memory_of(fusion, global) == MemoryType::Global {
                accesses.push(VectorizedAccess { tv: global, width, misaligned, merged_dims });
            }
        }
        debug!(%tv, width, merged_dims, "validated vectorization");
    }
    Ok(accesses)
}

/// Number of innermost root axes folded into the vectorized leaf.
///
/// The leaf must be the inner half of an inner split of an axis built only
/// by merging the innermost non-broadcast root axes.
fn vectorized_root_dims(fusion: &Fusion, tv: ValId, vector_id: IterDomainId) -> Result<usize> {
    let split_input = match fusion.id(vector_id).definition.map(|t| *fusion.transform(t)) {
        Some(IdTransform::Split { input, inner, inner_split: true, .. }) if inner == vector_id => input,
        _ => return InvalidVectorizeSnafu { tv, reason: "the vectorized axis must be the inner part of a split" }.fail(),
    };

    let mut roots = Vec::new();
    let mut stack = vec![split_input];
    while let Some(id) = stack.pop() {
        match fusion.id(id).definition.map(|t| *fusion.transform(t)) {
            None => roots.push(id),
            Some(IdTransform::Merge { outer, inner, .. }) => stack.extend([outer, inner]),
            Some(IdTransform::Split { .. }) => {
                return InvalidVectorizeSnafu { tv, reason: "the vectorized axis must come from merged root axes" }.fail();
            }
        }
    }
    let concrete: Vec<IterDomainId> = fusion
        .non_reduction_root(tv)
        .into_iter()
        .filter(|&id| !fusion.id(id).is_broadcast())
        .collect();
    let merged: HashSet<IterDomainId> = roots.into_iter().filter(|&id| !fusion.id(id).is_broadcast()).collect();
    let count = merged.len();
    ensure!(
        count > 0 && count <= concrete.len() && concrete[concrete.len() - count..].iter().all(|id| merged.contains(id)),
        InvalidVectorizeSnafu { tv, reason: "the vectorized axis must come from the innermost root axes" }
    );
    Ok(count)
}
