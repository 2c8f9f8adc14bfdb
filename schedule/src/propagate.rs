//! Whole-graph schedule propagation.
//!
//! Automatic schedulers transform one reference tensor and then spread that
//! schedule over the fusion: [`propagate_transforms`] replays the reference's
//! leaf domain onto every reachable tensor, [`parallelize_all_like`] copies
//! its parallel bindings onto the mapped axes.

use std::collections::{HashMap, HashSet, VecDeque};

use fuser_ir::{Fusion, IterDomainId, ParallelTypeSet, ValId};
use tracing::{debug, trace};

use crate::error::*;
use crate::replay::{ReplayMode, best_effort_map, replay_consumer_as_producer, replay_producer_as_consumer};
use crate::root_map::pairwise_root_pairs;

/// Neighbours of `tv` across one expression: producers first, then consumers.
fn neighbours(fusion: &Fusion, tv: ValId) -> Vec<(ValId, bool)> {
    let mut result: Vec<(ValId, bool)> = fusion.producer_tvs(tv).into_iter().map(|p| (p, true)).collect();
    result.extend(fusion.consumer_tvs(tv).into_iter().map(|c| (c, false)));
    result
}

/// Replay `reference`'s full leaf domain across the graph.
///
/// Tensors are visited along a maximum spanning tree: each step takes the
/// edge that carries the most non-broadcast reference root axes into an
/// unvisited tensor, then the most axes overall, so a tensor is replayed
/// from the neighbour that shares the most of the reference's iteration
/// space. Compute-at positions are left untouched.
pub fn propagate_transforms(fusion: &mut Fusion, reference: ValId) -> Result<()> {
    fusion.ensure_tensor(reference)?;
    let root: HashMap<IterDomainId, IterDomainId> =
        fusion.tv(reference).domain().maybe_rfactor().iter().map(|&id| (id, id)).collect();
    let mut order = vec![reference];
    let mut carried = HashMap::from([(reference, root.clone())]);
    for sibling in fusion.siblings(reference) {
        order.push(sibling);
        carried.insert(sibling, root.clone());
    }

    loop {
        let mut best: Option<((usize, usize), ValId, ValId, bool, HashMap<IterDomainId, IterDomainId>)> = None;
        for &from in &order {
            for (to, is_producer) in neighbours(fusion, from) {
                if carried.contains_key(&to) {
                    continue;
                }
                let next = carry(fusion, &carried[&from], from, to, is_producer);
                let concrete = next.values().filter(|&&id| !fusion.id(id).is_broadcast()).count();
                let score = (concrete, next.len());
                if best.as_ref().is_none_or(|(best_score, ..)| score > *best_score) {
                    best = Some((score, from, to, is_producer, next));
                }
            }
        }
        let Some((score, from, to, is_producer, next)) = best else { break };
        let pos = fusion.tv(from).n_dims();
        if is_producer {
            replay_producer_as_consumer(fusion, None, to, from, pos, ReplayMode::Propagate)?;
        } else {
            replay_consumer_as_producer(fusion, None, to, from, pos, ReplayMode::Propagate)?;
        }
        trace!(%from, %to, ?score, "propagated transforms");
        for sibling in fusion.siblings(to) {
            order.push(sibling);
            carried.insert(sibling, next.clone());
        }
        order.push(to);
        carried.insert(to, next);
    }
    debug!(%reference, tensors = order.len(), "propagated transforms");
    Ok(())
}

/// Reference root axes still present after crossing from `from` to `to`.
fn carry(
    fusion: &Fusion,
    carried: &HashMap<IterDomainId, IterDomainId>,
    from: ValId,
    to: ValId,
    to_is_producer: bool,
) -> HashMap<IterDomainId, IterDomainId> {
    let step: HashMap<IterDomainId, IterDomainId> = if to_is_producer {
        pairwise_root_pairs(fusion, to, from).into_iter().map(|(p, c)| (c, p)).collect()
    } else {
        pairwise_root_pairs(fusion, from, to).into_iter().collect()
    };
    carried.iter().filter_map(|(&r, id)| step.get(id).map(|&next| (r, next))).collect()
}

/// Leaf ids of every reachable tensor structurally matched to `reference`'s
/// leaf ids, keeping for each tensor the largest match over all paths.
pub(crate) fn leaf_correspondence(fusion: &Fusion, reference: ValId) -> HashMap<ValId, HashMap<IterDomainId, IterDomainId>> {
    let identity: HashMap<IterDomainId, IterDomainId> = fusion.tv(reference).domain().leaf().iter().map(|&id| (id, id)).collect();
    let mut maps = HashMap::from([(reference, identity)]);
    let mut queue = VecDeque::from([reference]);
    while let Some(from) = queue.pop_front() {
        for (to, is_producer) in neighbours(fusion, from) {
            let pairs: Vec<(IterDomainId, IterDomainId)> = if is_producer {
                pairwise_root_pairs(fusion, to, from).into_iter().map(|(p, c)| (c, p)).collect()
            } else {
                pairwise_root_pairs(fusion, from, to)
            };
            let step = best_effort_map(fusion, from, to, &pairs);
            let to_leaf: HashSet<IterDomainId> = fusion.tv(to).domain().leaf().iter().copied().collect();
            let composed: HashMap<IterDomainId, IterDomainId> = maps[&from]
                .iter()
                .filter_map(|(&r, f)| step.get(f).map(|&t| (r, t)))
                .filter(|(_, t)| to_leaf.contains(t))
                .collect();
            if maps.get(&to).is_some_and(|existing| existing.len() >= composed.len()) {
                continue;
            }
            maps.insert(to, composed);
            queue.push_back(to);
        }
    }
    maps
}

/// Copy the parallel types in `types` from `reference`'s leaves onto the
/// mapped leaves of `tvs`, or of every non-input tensor when `tvs` is empty.
pub fn parallelize_all_like(fusion: &mut Fusion, reference: ValId, tvs: &[ValId], types: ParallelTypeSet) -> Result<()> {
    fusion.ensure_tensor(reference)?;
    let maps = leaf_correspondence(fusion, reference);
    let selected: Vec<ValId> = if tvs.is_empty() { fusion.all_tensors() } else { tvs.to_vec() };
    for tv in selected {
        if fusion.is_input(tv) || tv == reference {
            continue;
        }
        let Some(map) = maps.get(&tv) else { continue };
        let leaf = fusion.tv(tv).domain().leaf().to_vec();
        for (&reference_id, &id) in map {
            let parallel = fusion.id(reference_id).parallel_type;
            if !types.contains(parallel) {
                continue;
            }
            if parallel.is_vectorize() && leaf.last() != Some(&id) {
                continue;
            }
            fusion.id_mut(id).parallel_type = parallel;
        }
        fusion.sync_siblings(tv);
    }
    Ok(())
}
