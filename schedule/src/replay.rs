//! Transform replay between producers and consumers.
//!
//! Replaying makes the leading leaf axes of a target tensor structurally
//! identical to those of a source tensor, starting from a set of root
//! correspondences. Transforms the target already has are reused when they
//! match; conflicting ones are undone as long as they are not fixed by a
//! compute-at position.

use std::collections::{HashMap, HashSet};

use fuser_ir::{Fusion, IdTransform, IterDomainId, TransformId, ValId, same_scalar};
use snafu::ensure;
use tracing::trace;

use crate::domain::{merge_ids, split_id};
use crate::error::*;
use crate::root_map::{ComputeAtRootDomainMap, pairwise_root_pairs};

/// How strictly a replay treats axes without a counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Inlining: every non-broadcast source axis inside the position must map.
    ComputeAt,
    /// Schedule propagation: unmapped axes are left behind.
    Propagate,
}

/// Ids of `from`'s history matched to ids of `to`'s current history.
///
/// Starting from `root_pairs`, every transform of `from` is matched with an
/// identical transform of `to` applied to the mapped inputs. A broadcast axis
/// merged into a mapped axis on either side is looked through.
pub fn best_effort_map(
    fusion: &Fusion,
    from: ValId,
    to: ValId,
    root_pairs: &[(IterDomainId, IterDomainId)],
) -> HashMap<IterDomainId, IterDomainId> {
    let to_history = fusion.history(to);
    let to_uses = uses_in(fusion, &to_history);

    let mut map: HashMap<IterDomainId, IterDomainId> = HashMap::new();
    let mut images: HashSet<IterDomainId> = HashSet::new();
    for &(a, b) in root_pairs {
        let b = forward_broadcast_merges(fusion, &to_uses, &images, b);
        map.insert(a, b);
        images.insert(b);
    }

    for t in fusion.history(from) {
        match *fusion.transform(t) {
            IdTransform::Split { input, outer, inner, factor, inner_split } => {
                let Some(&target) = map.get(&input) else { continue };
                let Some(&use_t) = to_uses.get(&target) else { continue };
                if let IdTransform::Split { outer: o, inner: i, factor: f, inner_split: s, .. } = *fusion.transform(use_t)
                    && s == inner_split
                    && same_scalar(fusion, f, factor)
                {
                    for (a, b) in [(outer, o), (inner, i)] {
                        let b = forward_broadcast_merges(fusion, &to_uses, &images, b);
                        map.insert(a, b);
                        images.insert(b);
                    }
                }
            }
            IdTransform::Merge { outer, inner, output } => {
                let target = match (map.get(&outer).copied(), map.get(&inner).copied()) {
                    (Some(o), Some(i)) => match to_uses.get(&o).map(|&u| *fusion.transform(u)) {
                        Some(IdTransform::Merge { outer: mo, inner: mi, output: out }) if mo == o && mi == i => Some(out),
                        _ => None,
                    },
                    (None, Some(i)) if fusion.id(outer).is_broadcast() => Some(i),
                    (Some(o), None) if fusion.id(inner).is_broadcast() => Some(o),
                    _ => None,
                };
                if let Some(b) = target {
                    let b = forward_broadcast_merges(fusion, &to_uses, &images, b);
                    map.insert(output, b);
                    images.insert(b);
                }
            }
        }
    }
    map
}

/// The transform consuming each id within `history`.
fn uses_in(fusion: &Fusion, history: &[TransformId]) -> HashMap<IterDomainId, TransformId> {
    let mut uses = HashMap::new();
    for &t in history {
        for input in fusion.transform(t).inputs() {
            uses.insert(input, t);
        }
    }
    uses
}

/// Follow merges of `id` with broadcast axes that nothing maps to.
fn forward_broadcast_merges(
    fusion: &Fusion,
    uses: &HashMap<IterDomainId, TransformId>,
    images: &HashSet<IterDomainId>,
    mut id: IterDomainId,
) -> IterDomainId {
    while let Some(&t) = uses.get(&id)
        && let IdTransform::Merge { outer, inner, output } = *fusion.transform(t)
    {
        let other = if outer == id { inner } else { outer };
        if !fusion.id(other).is_broadcast() || images.contains(&other) || fusion.id(id).is_broadcast() {
            break;
        }
        id = output;
    }
    id
}

/// Working leaf list of a replay target.
struct Frontier {
    tv: ValId,
    leaf: Vec<IterDomainId>,
    fixed: usize,
}

impl Frontier {
    fn new(fusion: &Fusion, tv: ValId) -> Self {
        let view = fusion.tv(tv);
        Self { tv, leaf: view.domain().leaf().to_vec(), fixed: view.fixed_position() }
    }

    fn position(&self, id: IterDomainId) -> Option<usize> {
        self.leaf.iter().position(|&leaf| leaf == id)
    }

    /// Bring `id` back into the leaf list by undoing the transforms applied
    /// to it, most recent first.
    fn expose(&mut self, fusion: &Fusion, id: IterDomainId) -> Result<usize> {
        loop {
            if let Some(pos) = self.position(id) {
                return Ok(pos);
            }
            let root = fusion.tv(self.tv).domain().root().to_vec();
            let live = fusion.transforms_between(&root, &self.leaf);
            let mut derived: HashSet<IterDomainId> = HashSet::from([id]);
            let mut latest = None;
            for t in live {
                let transform = fusion.transform(t);
                if transform.inputs().iter().any(|input| derived.contains(input)) {
                    derived.extend(transform.outputs());
                    latest = Some(t);
                }
            }
            let Some(t) = latest else { return ReplayConflictSnafu { tv: self.tv }.fail() };
            let transform = fusion.transform(t);
            let mut positions = Vec::new();
            for output in transform.outputs() {
                match self.position(output) {
                    Some(pos) if pos >= self.fixed => positions.push(pos),
                    _ => return ReplayConflictSnafu { tv: self.tv }.fail(),
                }
            }
            let at = positions.iter().copied().min().unwrap_or(0);
            positions.sort_unstable_by(|a, b| b.cmp(a));
            for pos in positions {
                self.leaf.remove(pos);
            }
            for (offset, input) in transform.inputs().into_iter().enumerate() {
                self.leaf.insert(at + offset, input);
            }
            trace!(tv = %self.tv, transform = %t, "undid transform for replay");
        }
    }

    fn ensure_transformable(&self, pos: usize) -> Result<()> {
        ensure!(pos >= self.fixed, ReplayConflictSnafu { tv: self.tv });
        Ok(())
    }
}

/// Replay `source.leaf[..pos]` onto `target`.
///
/// `pairs` relate source ids to target ids: the maybe-rfactor domain of a
/// producer source, the root of a consumer source. Returns the target
/// position matching `pos`.
fn replay(
    fusion: &mut Fusion,
    source: ValId,
    target: ValId,
    pairs: &[(IterDomainId, IterDomainId)],
    pos: usize,
    mode: ReplayMode,
    unmappable: impl Fn(IterDomainId) -> ScheduleError,
) -> Result<usize> {
    let mut map = best_effort_map(fusion, source, target, pairs);
    let domain = fusion.tv(source).domain();
    let source_leaf = domain.leaf()[..pos].to_vec();
    let start = if fusion.producer_tvs(target).contains(&source) { domain.maybe_rfactor() } else { domain.root() };
    let needed = fusion.transforms_between(start, &source_leaf);
    let mut frontier = Frontier::new(fusion, target);

    for t in needed {
        match *fusion.transform(t) {
            IdTransform::Split { input, outer, inner, factor, inner_split } => {
                if map.contains_key(&outer) && map.contains_key(&inner) {
                    continue;
                }
                let Some(&mapped) = map.get(&input) else { continue };
                let at = frontier.expose(fusion, mapped)?;
                frontier.ensure_transformable(at)?;
                let (o, i) = split_id(fusion, mapped, factor, inner_split)?;
                frontier.leaf.splice(at..=at, [o, i]);
                map.insert(outer, o);
                map.insert(inner, i);
            }
            IdTransform::Merge { outer, inner, output } => {
                if map.contains_key(&output) {
                    continue;
                }
                match (map.get(&outer).copied(), map.get(&inner).copied()) {
                    (Some(o), Some(i)) => {
                        let at_o = frontier.expose(fusion, o)?;
                        let at_i = frontier.expose(fusion, i)?;
                        frontier.ensure_transformable(at_o.min(at_i))?;
                        let merged = match merge_ids(fusion, o, i) {
                            Ok(merged) => merged,
                            Err(reason) => {
                                return InvalidMergeSnafu { tv: target, outer: at_o, inner: at_i, reason }.fail();
                            }
                        };
                        let (lo, hi) = (at_o.min(at_i), at_o.max(at_i));
                        frontier.leaf.remove(hi);
                        frontier.leaf[lo] = merged;
                        map.insert(output, merged);
                    }
                    (None, Some(i)) if fusion.id(outer).is_broadcast() => {
                        map.insert(output, i);
                    }
                    (Some(o), None) if fusion.id(inner).is_broadcast() => {
                        map.insert(output, o);
                    }
                    _ => {}
                }
            }
        }
    }

    let mut prefix: Vec<IterDomainId> = Vec::with_capacity(pos);
    for &id in &source_leaf {
        match map.get(&id) {
            Some(&mapped) => {
                frontier.expose(fusion, mapped)?;
                if !prefix.contains(&mapped) {
                    prefix.push(mapped);
                }
            }
            None if fusion.id(id).is_broadcast() || mode == ReplayMode::Propagate => {}
            None => return Err(unmappable(id)),
        }
    }

    let mut new_leaf = prefix.clone();
    new_leaf.extend(frontier.leaf.iter().copied().filter(|id| !prefix.contains(id)));
    let old_leaf = fusion.tv(target).domain().leaf().to_vec();
    let fixed = frontier.fixed.min(old_leaf.len());
    ensure!(new_leaf.len() >= fixed && new_leaf[..fixed] == old_leaf[..fixed], ReplayConflictSnafu { tv: target });

    trace!(%source, %target, pos, target_pos = prefix.len(), leaf = ?new_leaf, "replayed");
    fusion.tv_mut(target).domain_mut().set_leaf(new_leaf);
    fusion.sync_siblings(target);
    Ok(prefix.len())
}

/// Replay the consumer's leading `pos` axes onto its producer.
///
/// With a root map, only root pairs it accepts seed the replay.
pub fn replay_producer_as_consumer(
    fusion: &mut Fusion,
    root_map: Option<&ComputeAtRootDomainMap>,
    producer: ValId,
    consumer: ValId,
    pos: usize,
    mode: ReplayMode,
) -> Result<usize> {
    let pairs: Vec<(IterDomainId, IterDomainId)> = pairwise_root_pairs(fusion, producer, consumer)
        .into_iter()
        .filter(|&(p, c)| root_map.is_none_or(|map| map.can_map(producer, p, consumer, c)))
        .map(|(p, c)| (c, p))
        .collect();
    ensure!(fusion.producer_tvs(consumer).contains(&producer), NotAProducerSnafu { producer, consumer });
    replay(fusion, consumer, producer, &pairs, pos, mode, |id| ScheduleError::UnmappableAxis {
        producer,
        consumer,
        id,
    })
}

/// Replay the producer's leading `pos` axes onto its consumer.
pub fn replay_consumer_as_producer(
    fusion: &mut Fusion,
    root_map: Option<&ComputeAtRootDomainMap>,
    consumer: ValId,
    producer: ValId,
    pos: usize,
    mode: ReplayMode,
) -> Result<usize> {
    if mode == ReplayMode::ComputeAt
        && let Some(&id) = fusion.tv(producer).domain().leaf()[..pos].iter().find(|&&id| fusion.id(id).is_reduction())
    {
        return ReductionInlinedSnafu { tv: producer, id }.fail();
    }
    let pairs: Vec<(IterDomainId, IterDomainId)> = pairwise_root_pairs(fusion, producer, consumer)
        .into_iter()
        .filter(|&(p, c)| root_map.is_none_or(|map| map.can_map(producer, p, consumer, c)))
        .collect();
    ensure!(fusion.producer_tvs(consumer).contains(&producer), NotAProducerSnafu { producer, consumer });
    replay(fusion, producer, consumer, &pairs, pos, mode, |id| ScheduleError::UnmappableAxis {
        producer,
        consumer,
        id,
    })
}
