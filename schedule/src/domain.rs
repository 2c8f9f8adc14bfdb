//! Domain algebra: split, merge and reorder of a tensor's leaf domain.
//!
//! Every transform creates fresh iteration domains and records itself in the
//! fusion's append-only history; the replaced leaves stay reachable from the
//! new ones.

use std::collections::HashMap;

use fuser_ir::{
    Fusion, IdTransform, IterDomain, IterDomainId, IterType, ParallelType, TransformId, ValId, const_int,
    normalize_axis,
};
use snafu::ensure;
use tracing::trace;

use crate::error::*;

/// Split factor: a compile-time constant or an integer fusion scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitFactor {
    Const(i64),
    Val(ValId),
}

impl From<i64> for SplitFactor {
    fn from(value: i64) -> Self {
        Self::Const(value)
    }
}

impl From<i32> for SplitFactor {
    fn from(value: i32) -> Self {
        Self::Const(value as i64)
    }
}

impl From<usize> for SplitFactor {
    fn from(value: usize) -> Self {
        Self::Const(value as i64)
    }
}

impl From<ValId> for SplitFactor {
    fn from(value: ValId) -> Self {
        Self::Val(value)
    }
}

pub(crate) fn ensure_unfixed(fusion: &Fusion, tv: ValId, axis: usize) -> Result<()> {
    let fixed = fusion.tv(tv).fixed_position();
    ensure!(axis >= fixed, AxisFixedSnafu { tv, axis, fixed });
    Ok(())
}

/// Unscheduled copy of `like` with the given iteration type.
pub(crate) fn fresh_axis(fusion: &mut Fusion, like: IterDomainId, iter_type: IterType) -> IterDomainId {
    let id = fusion.clone_iter_domain(like);
    let axis = fusion.id_mut(id);
    axis.iter_type = iter_type;
    axis.parallel_type = ParallelType::Serial;
    id
}

/// Split `id` into `(outer, inner)`.
///
/// With `inner_split` the inner extent is `factor` and the outer extent
/// `ceilDiv(extent, factor)`; otherwise the roles swap.
pub(crate) fn split_id(
    fusion: &mut Fusion,
    id: IterDomainId,
    factor: ValId,
    inner_split: bool,
) -> Result<(IterDomainId, IterDomainId)> {
    let axis = fusion.id(id).clone();
    let remainder = fusion.ceil_div(axis.extent, factor)?;
    let (outer_extent, inner_extent) = if inner_split { (remainder, factor) } else { (factor, remainder) };
    let outer = fusion.new_iter_domain(IterDomain::new(axis.start, outer_extent, axis.iter_type));
    let inner = fusion.new_iter_domain(IterDomain::new(axis.start, inner_extent, axis.iter_type));
    let transform = fusion.add_transform(IdTransform::Split { input: id, outer, inner, factor, inner_split });
    trace!(%id, %outer, %inner, %transform, inner_split, "split");
    Ok((outer, inner))
}

/// Iteration type of merging an `outer` and an `inner` axis.
///
/// Broadcast merges with anything; iteration and reduction never mix.
pub(crate) fn merged_type(outer: IterType, inner: IterType) -> Option<IterType> {
    match (outer, inner) {
        (IterType::Broadcast, other) | (other, IterType::Broadcast) => Some(other),
        (a, b) if a == b => Some(a),
        _ => None,
    }
}

pub(crate) fn merge_ids(fusion: &mut Fusion, outer: IterDomainId, inner: IterDomainId) -> Result<IterDomainId, &'static str> {
    let (o, i) = (fusion.id(outer).clone(), fusion.id(inner).clone());
    let Some(iter_type) = merged_type(o.iter_type, i.iter_type) else {
        return Err("iteration and reduction axes cannot be merged");
    };
    let Ok(extent) = fusion.mul(o.extent, i.extent) else { return Err("extents are not integers") };
    let output = fusion.new_iter_domain(IterDomain::new(o.start, extent, iter_type));
    let transform = fusion.add_transform(IdTransform::Merge { outer, inner, output });
    trace!(%outer, %inner, %output, %transform, "merge");
    Ok(output)
}

/// Apply `t` to the images of its inputs, recording images of its outputs.
///
/// Returns `false` without transforming anything when an input has no image.
pub(crate) fn replay_transform(
    fusion: &mut Fusion,
    tv: ValId,
    t: TransformId,
    map: &mut HashMap<IterDomainId, IterDomainId>,
) -> Result<bool> {
    match *fusion.transform(t) {
        IdTransform::Split { input, outer, inner, factor, inner_split } => {
            let Some(&image) = map.get(&input) else { return Ok(false) };
            let (o, i) = split_id(fusion, image, factor, inner_split)?;
            map.insert(outer, o);
            map.insert(inner, i);
        }
        IdTransform::Merge { outer, inner, output } => {
            let (Some(&o), Some(&i)) = (map.get(&outer), map.get(&inner)) else { return Ok(false) };
            let Ok(merged) = merge_ids(fusion, o, i) else { return ReplayConflictSnafu { tv }.fail() };
            map.insert(output, merged);
        }
    }
    Ok(true)
}

fn resolve_factor(fusion: &mut Fusion, tv: ValId, factor: SplitFactor) -> Result<ValId> {
    match factor {
        SplitFactor::Const(f) => {
            ensure!(f > 0, InvalidSplitFactorSnafu { tv });
            Ok(fusion.int_val(f))
        }
        SplitFactor::Val(v) => {
            ensure!(!fusion.is_tensor(v) && fusion.dtype(v).is_int(), InvalidSplitFactorSnafu { tv });
            if let Some(f) = const_int(fusion, v) {
                ensure!(f > 0, InvalidSplitFactorSnafu { tv });
            }
            Ok(v)
        }
    }
}

pub(crate) fn split(fusion: &mut Fusion, tv: ValId, axis: isize, factor: SplitFactor, inner_split: bool) -> Result<()> {
    let ndims = fusion.ensure_tensor(tv)?.n_dims();
    let axis = normalize_axis(axis, ndims)?;
    ensure_unfixed(fusion, tv, axis)?;
    let factor = resolve_factor(fusion, tv, factor)?;
    let id = fusion.tv(tv).axis(axis);
    let (outer, inner) = split_id(fusion, id, factor, inner_split)?;
    let mut leaf = fusion.tv(tv).domain().leaf().to_vec();
    leaf.splice(axis..=axis, [outer, inner]);
    fusion.tv_mut(tv).domain_mut().set_leaf(leaf);
    fusion.sync_siblings(tv);
    Ok(())
}

pub(crate) fn merge(fusion: &mut Fusion, tv: ValId, axis_o: isize, axis_i: isize) -> Result<()> {
    let ndims = fusion.ensure_tensor(tv)?.n_dims();
    let outer = normalize_axis(axis_o, ndims)?;
    let inner = normalize_axis(axis_i, ndims)?;
    ensure!(outer != inner, InvalidMergeSnafu { tv, outer, inner, reason: "an axis cannot merge with itself" });
    let (lo, hi) = (outer.min(inner), outer.max(inner));
    ensure_unfixed(fusion, tv, lo)?;

    let (outer_id, inner_id) = (fusion.tv(tv).axis(outer), fusion.tv(tv).axis(inner));
    let merged = match merge_ids(fusion, outer_id, inner_id) {
        Ok(merged) => merged,
        Err(reason) => return InvalidMergeSnafu { tv, outer, inner, reason }.fail(),
    };
    let mut leaf = fusion.tv(tv).domain().leaf().to_vec();
    leaf.remove(hi);
    leaf[lo] = merged;
    fusion.tv_mut(tv).domain_mut().set_leaf(leaf);
    fusion.sync_siblings(tv);
    Ok(())
}

/// Permute the leaf domain. Axes not named in `old2new` keep their relative
/// order in the remaining slots.
pub(crate) fn reorder(fusion: &mut Fusion, tv: ValId, old2new: &[(isize, isize)]) -> Result<()> {
    let leaf = fusion.ensure_tensor(tv)?.domain().leaf().to_vec();
    let ndims = leaf.len();
    let mut placed: Vec<Option<IterDomainId>> = vec![None; ndims];
    let mut moved = vec![false; ndims];
    for &(old, new) in old2new {
        let old = normalize_axis(old, ndims)?;
        let new = normalize_axis(new, ndims)?;
        ensure!(!moved[old], InvalidReorderSnafu { tv, reason: "an axis is moved twice" });
        ensure!(placed[new].is_none(), InvalidReorderSnafu { tv, reason: "two axes are moved to the same position" });
        moved[old] = true;
        placed[new] = Some(leaf[old]);
    }
    let mut rest = leaf.iter().enumerate().filter(|&(i, _)| !moved[i]).map(|(_, &id)| id);
    let new_leaf: Vec<IterDomainId> = placed
        .into_iter()
        .map(|slot| match slot {
            Some(id) => id,
            None => match rest.next() {
                Some(id) => id,
                None => unreachable!("every free slot has a remaining axis"),
            },
        })
        .collect();
    let fixed = fusion.tv(tv).fixed_position();
    if new_leaf[..fixed] != leaf[..fixed] {
        let axis = (0..fixed).find(|&i| new_leaf[i] != leaf[i]).unwrap_or(0);
        return AxisFixedSnafu { tv, axis, fixed }.fail();
    }
    fusion.tv_mut(tv).domain_mut().set_leaf(new_leaf);
    fusion.sync_siblings(tv);
    Ok(())
}

pub(crate) fn parallelize(fusion: &mut Fusion, tv: ValId, axis: isize, parallel: ParallelType) -> Result<()> {
    let ndims = fusion.ensure_tensor(tv)?.n_dims();
    let axis = normalize_axis(axis, ndims)?;
    let id = fusion.tv(tv).axis(axis);
    if parallel.is_vectorize() {
        ensure!(
            axis + 1 == ndims,
            InvalidParallelizeSnafu { tv, axis, parallel, reason: "vectorized axes must be innermost" }
        );
        ensure!(
            const_int(fusion, fusion.extent(id)).is_some(),
            InvalidParallelizeSnafu { tv, axis, parallel, reason: "vector width must be a constant" }
        );
    }
    fusion.id_mut(id).parallel_type = parallel;
    Ok(())
}
