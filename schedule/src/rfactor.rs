//! Reduction factoring.
//!
//! `rfactor(tv, axes)` splits a reduction in two: a partial tensor that
//! reduces only the chosen leaf axes and keeps the other reduction axes as
//! iterations, and the original tensor reducing what is left. Welford
//! outputs are factored together and the second stage becomes a Welford
//! combine over the partial triples.

use std::collections::{HashMap, HashSet};

use fuser_ir::{Fusion, IdTransform, IterDomainId, IterType, TensorDomain, TransformId, ValId, normalize_axis};
use snafu::ensure;
use tracing::debug;

use crate::domain::{fresh_axis, replay_transform};
use crate::error::*;

pub(crate) fn rfactor(fusion: &mut Fusion, tv: ValId, axes: &[isize]) -> Result<ValId> {
    fusion.ensure_tensor(tv)?;
    let invalid = |reason: &'static str| InvalidRFactorSnafu { tv, reason };
    let Some(def) = fusion.definition(tv) else { return invalid("it is not defined by a reduction").fail() };
    ensure!(fusion.expr(def).kind().is_reduction(), invalid("it is not defined by a reduction"));
    ensure!(fusion.tv(tv).fixed_position() == 0, invalid("it already has a compute-at position"));
    ensure!(!fusion.tv(tv).domain().has_rfactor(), invalid("it already has an rfactor domain"));

    let domain = fusion.tv(tv).domain().clone();
    let leaf = domain.leaf().to_vec();
    let mut chosen = HashSet::new();
    for &axis in axes {
        let axis = normalize_axis(axis, leaf.len())?;
        ensure!(fusion.id(leaf[axis]).is_reduction(), invalid("only reduction axes can be factored"));
        chosen.insert(leaf[axis]);
    }
    ensure!(!chosen.is_empty(), invalid("no axes were given"));
    let kept: Vec<IterDomainId> =
        leaf.iter().copied().filter(|&id| fusion.id(id).is_reduction() && !chosen.contains(&id)).collect();
    ensure!(!kept.is_empty(), invalid("every reduction axis was chosen"));

    let history = fusion.history(tv);
    let chosen_ancestry = with_ancestors(fusion, chosen.iter().copied());
    let kept_ancestry = with_ancestors(fusion, kept.iter().copied());
    // Axes serving only the kept reductions turn into iterations of the partial.
    let rfactored: HashSet<IterDomainId> = kept_ancestry.difference(&chosen_ancestry).copied().collect();
    let needed: Vec<TransformId> = history
        .iter()
        .copied()
        .filter(|&t| fusion.transform(t).outputs().iter().any(|id| kept_ancestry.contains(id)))
        .collect();

    // Partial tensor: the whole schedule on a fresh copy of the root.
    let mut to_partial: HashMap<IterDomainId, IterDomainId> = HashMap::new();
    let mut partial_root = Vec::with_capacity(domain.root().len());
    for &id in domain.root() {
        let iter_type = fusion.id(id).iter_type;
        let copy = fresh_axis(fusion, id, iter_type);
        to_partial.insert(id, copy);
        partial_root.push(copy);
    }
    for &t in &history {
        replay_transform(fusion, tv, t, &mut to_partial)?;
    }
    for old in &rfactored {
        let id = image(&to_partial, *old);
        let axis = fusion.id_mut(id);
        axis.iter_type = IterType::Iteration;
        axis.is_rfactor = true;
    }

    let mut frontier = domain.root().to_vec();
    for &t in &needed {
        apply_positionally(&mut frontier, fusion.transform(t));
    }
    let partial_rfactor: Vec<IterDomainId> = frontier.iter().map(|&id| image(&to_partial, id)).collect();
    let partial_leaf: Vec<IterDomainId> = leaf.iter().map(|&id| image(&to_partial, id)).collect();
    for (&old, &new) in leaf.iter().zip(&partial_leaf) {
        fusion.id_mut(new).parallel_type = fusion.id(old).parallel_type;
    }

    // Second stage: reduces the kept axes over the partial's rfactor domain.
    let mut to_consumer: HashMap<IterDomainId, IterDomainId> = HashMap::new();
    let mut consumer_root = Vec::with_capacity(frontier.len());
    for &old in &frontier {
        let iter_type = if rfactored.contains(&old) {
            IterType::Reduction
        } else if fusion.id(old).is_reduction() {
            continue;
        } else {
            fusion.id(old).iter_type
        };
        let copy = fresh_axis(fusion, old, iter_type);
        to_consumer.insert(old, copy);
        consumer_root.push(copy);
    }
    for &t in history.iter().filter(|t| !needed.contains(t)) {
        replay_transform(fusion, tv, t, &mut to_consumer)?;
    }
    let mut consumer_leaf = Vec::with_capacity(leaf.len() - chosen.len());
    for &old in leaf.iter().filter(|id| !chosen.contains(id)) {
        let Some(&new) = to_consumer.get(&old) else { return invalid("a remaining axis depends on a factored one").fail() };
        fusion.id_mut(new).parallel_type = fusion.id(old).parallel_type;
        consumer_leaf.push(new);
    }

    let expr = fusion.expr(def).clone();
    let outputs = expr.outputs().to_vec();
    let partial_domain = TensorDomain::with_rfactor(partial_root, partial_rfactor, partial_leaf);
    let dtypes: Vec<_> = outputs.iter().map(|&o| fusion.dtype(o)).collect();
    let partials: Vec<ValId> = dtypes.into_iter().map(|dtype| fusion.new_tensor(partial_domain.clone(), dtype)).collect();

    fusion.remove_expr(def);
    fusion.register_expr(expr.kind().clone(), expr.inputs().to_vec(), partials.clone());
    fusion.register_expr(expr.kind().clone(), partials.clone(), outputs.clone());

    let mut consumer_domain = TensorDomain::contiguous(consumer_root);
    consumer_domain.set_leaf(consumer_leaf);
    fusion.tv_mut(tv).set_domain(consumer_domain);
    fusion.sync_siblings(tv);

    let position = outputs.iter().position(|&o| o == tv).unwrap_or(0);
    let partial = partials[position];
    debug!(%tv, %partial, factored = chosen.len(), remaining = kept.len(), "rfactor");
    Ok(partial)
}

fn image(map: &HashMap<IterDomainId, IterDomainId>, id: IterDomainId) -> IterDomainId {
    match map.get(&id) {
        Some(&image) => image,
        None => unreachable!("{id} was replayed onto the partial"),
    }
}

/// `ids` together with everything they were derived from.
fn with_ancestors(fusion: &Fusion, ids: impl IntoIterator<Item = IterDomainId>) -> HashSet<IterDomainId> {
    let mut seen = HashSet::new();
    let mut stack: Vec<IterDomainId> = ids.into_iter().collect();
    while let Some(id) = stack.pop() {
        if seen.insert(id)
            && let Some(def) = fusion.id(id).definition
        {
            stack.extend(fusion.transform(def).inputs());
        }
    }
    seen
}

/// Apply a transform to an ordered domain in place of its inputs.
pub(crate) fn apply_positionally(domain: &mut Vec<IterDomainId>, transform: &IdTransform) {
    match *transform {
        IdTransform::Split { input, outer, inner, .. } => {
            if let Some(pos) = domain.iter().position(|&id| id == input) {
                domain.splice(pos..=pos, [outer, inner]);
            }
        }
        IdTransform::Merge { outer, inner, output } => {
            if let Some(pos) = domain.iter().position(|&id| id == outer) {
                domain[pos] = output;
                domain.retain(|&id| id != inner);
            }
        }
    }
}
