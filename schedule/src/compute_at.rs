//! The computeAt engine.
//!
//! `compute_at(producer, consumer, pos)` inlines the producer's loop nest
//! into the consumer's first `pos` loops. Three phases run in order:
//!
//! 1. A backward pass replays every tensor on a dependency chain from the
//!    producer to the consumer as its first chain consumer, innermost
//!    first, and fixes its compute-at position.
//! 2. The common consumer, the first tensor at or after the consumer that
//!    every use path of the producer passes through, bounds the next phase.
//! 3. A forward pass walks the producer's uses in topological order and
//!    replays consumers off the chain as their producers, so sibling
//!    branches share the loops.
//!
//! Positions only ever grow, and existing compatible structure is reused by
//! the replay instead of being recreated.

use std::collections::{HashMap, HashSet};

use fuser_ir::{Fusion, ValId};
use snafu::ensure;
use tracing::{debug, trace};

use crate::error::*;
use crate::replay::{ReplayMode, replay_consumer_as_producer, replay_producer_as_consumer};
use crate::root_map::ComputeAtRootDomainMap;

pub(crate) fn compute_at(fusion: &mut Fusion, producer: ValId, consumer: ValId, pos: isize) -> Result<()> {
    fusion.ensure_tensor(producer)?;
    let ndims = fusion.ensure_tensor(consumer)?.n_dims();
    let pos = normalize_position(consumer, pos, ndims)?;
    ensure!(
        producer != consumer && fusion.depends_on(consumer, producer),
        NotAProducerSnafu { producer, consumer }
    );

    let root_map = ComputeAtRootDomainMap::build(fusion);
    let chain = chain_set(fusion, producer, consumer);
    debug!(%producer, %consumer, pos, chain = ?chain, "compute_at");

    backward_pass(fusion, &root_map, &chain, consumer, pos)?;

    let common = common_consumer(fusion, producer, consumer);
    if let Some(common) = common {
        trace!(%common, "common consumer");
    }
    forward_pass(fusion, &root_map, &chain, producer, consumer, common)
}

fn normalize_position(tv: ValId, pos: isize, ndims: usize) -> Result<usize> {
    let resolved = if pos < 0 { ndims as isize + 1 + pos } else { pos };
    ensure!((0..=ndims as isize).contains(&resolved), PositionOutOfRangeSnafu { tv, pos, ndims });
    Ok(resolved as usize)
}

/// Tensors on some path from `producer` to `consumer`, `consumer` excluded,
/// in topological order.
fn chain_set(fusion: &Fusion, producer: ValId, consumer: ValId) -> Vec<ValId> {
    fusion
        .all_tensors()
        .into_iter()
        .filter(|&tv| tv != consumer)
        .filter(|&tv| tv == producer || fusion.depends_on(tv, producer))
        .filter(|&tv| fusion.depends_on(consumer, tv))
        .collect()
}

fn backward_pass(
    fusion: &mut Fusion,
    root_map: &ComputeAtRootDomainMap,
    chain: &[ValId],
    consumer: ValId,
    pos: usize,
) -> Result<()> {
    let members: HashSet<ValId> = chain.iter().copied().chain([consumer]).collect();
    let mut positions: HashMap<ValId, usize> = HashMap::from([(consumer, pos)]);
    for &tv in chain.iter().rev() {
        if fusion.is_input(tv) {
            continue;
        }
        let Some(target) = fusion.consumer_tvs(tv).into_iter().find(|c| members.contains(c)) else {
            continue;
        };
        let Some(&target_pos) = positions.get(&target) else { continue };
        let tv_pos =
            replay_producer_as_consumer(fusion, Some(root_map), tv, target, target_pos, ReplayMode::ComputeAt)?;
        fusion.tv_mut(tv).set_compute_at_position(tv_pos);
        fusion.sync_siblings(tv);
        fusion.tv_mut(target).set_max_producer_position(target_pos);
        fusion.sync_siblings(target);
        positions.insert(tv, tv_pos);
        trace!(%tv, %target, tv_pos, target_pos, "backward replay");
    }
    Ok(())
}

/// Whether some tensor without consumers is reachable from `from` through
/// consumer edges without passing through `blocked`.
fn reaches_sink_avoiding(fusion: &Fusion, from: ValId, blocked: ValId) -> bool {
    let mut seen = HashSet::from([from]);
    let mut stack = vec![from];
    while let Some(tv) = stack.pop() {
        let consumers = fusion.consumer_tvs(tv);
        if consumers.is_empty() {
            return true;
        }
        for next in consumers {
            if next != blocked && seen.insert(next) {
                stack.push(next);
            }
        }
    }
    false
}

/// First tensor at or after `consumer` that every use path of `producer`
/// passes through.
fn common_consumer(fusion: &Fusion, producer: ValId, consumer: ValId) -> Option<ValId> {
    fusion
        .all_tensors()
        .into_iter()
        .filter(|&tv| tv == consumer || fusion.depends_on(tv, consumer))
        .find(|&tv| !reaches_sink_avoiding(fusion, producer, tv))
}

/// Replays every use edge reachable from `producer` before `consumer` or
/// `common`. Tensors are visited in topological order, so each one's
/// position is final before its own consumers are replayed.
fn forward_pass(
    fusion: &mut Fusion,
    root_map: &ComputeAtRootDomainMap,
    chain_members: &[ValId],
    producer: ValId,
    consumer: ValId,
    common: Option<ValId>,
) -> Result<()> {
    let targets: HashSet<ValId> = chain_members.iter().copied().chain([consumer]).collect();
    let positioned: HashSet<ValId> =
        chain_members.iter().copied().filter(|&tv| fusion.tv(tv).compute_at_position() > 0).collect();

    let mut active = HashSet::from([producer]);
    for tv in fusion.all_tensors() {
        if !active.contains(&tv) || tv == consumer || Some(tv) == common {
            continue;
        }
        for next in fusion.consumer_tvs(tv) {
            if tv == producer && fusion.is_input(tv) && !targets.contains(&next) {
                continue;
            }
            let view = fusion.tv(tv);
            let mut tv_pos =
                if positioned.contains(&tv) { view.compute_at_position() } else { view.max_producer_position() };
            if let Some(first_reduction) = view.domain().leaf().iter().position(|&id| fusion.id(id).is_reduction()) {
                tv_pos = tv_pos.min(first_reduction);
            }
            if !fusion.is_input(tv) {
                fusion.tv_mut(tv).set_compute_at_position(tv_pos);
                fusion.sync_siblings(tv);
            }
            let next_pos =
                replay_consumer_as_producer(fusion, Some(root_map), next, tv, tv_pos, ReplayMode::ComputeAt)?;
            fusion.tv_mut(next).set_max_producer_position(next_pos);
            fusion.sync_siblings(next);
            active.insert(next);
            trace!(%tv, %next, tv_pos, next_pos, "forward replay");
        }
    }
    Ok(())
}
