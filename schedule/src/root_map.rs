//! Root-domain mapping.
//!
//! [`PairwiseRootDomainMap`] relates the axes of one producer and one
//! consumer of a single expression. [`ComputeAtRootDomainMap`] closes those
//! pairs over the whole fusion and answers whether two root axes are provably
//! of equal extent, which is what inlining requires.

use std::collections::{HashMap, HashSet, VecDeque};

use fuser_ir::{ExprKind, Fusion, IterDomainId, ValId};
use itertools::Itertools;
use snafu::ensure;
use tracing::debug;

use crate::disjoint_sets::DisjointSets;
use crate::error::*;

/// Producer-to-consumer root pairs across one expression.
///
/// Producer axes are its maybe-rfactor domain without reductions; consumer
/// axes are its root. Axes a broadcast introduces have no producer.
#[derive(Debug, Clone)]
pub struct PairwiseRootDomainMap {
    producer: ValId,
    consumer: ValId,
    pairs: Vec<(IterDomainId, IterDomainId)>,
}

impl PairwiseRootDomainMap {
    pub fn new(fusion: &Fusion, producer: ValId, consumer: ValId) -> Result<Self> {
        ensure!(fusion.producer_tvs(consumer).contains(&producer), NotAProducerSnafu { producer, consumer });
        Ok(Self { producer, consumer, pairs: pairwise_root_pairs(fusion, producer, consumer) })
    }

    pub fn producer(&self) -> ValId {
        self.producer
    }

    pub fn consumer(&self) -> ValId {
        self.consumer
    }

    /// `(producer axis, consumer axis)` in consumer root order.
    pub fn pairs(&self) -> &[(IterDomainId, IterDomainId)] {
        &self.pairs
    }

    pub fn producer_to_consumer(&self) -> HashMap<IterDomainId, IterDomainId> {
        self.pairs.iter().copied().collect()
    }

    pub fn consumer_to_producer(&self) -> HashMap<IterDomainId, IterDomainId> {
        self.pairs.iter().map(|&(p, c)| (c, p)).collect()
    }
}

/// Root pairs of `producer` and `consumer`; empty if there is no direct edge.
pub(crate) fn pairwise_root_pairs(fusion: &Fusion, producer: ValId, consumer: ValId) -> Vec<(IterDomainId, IterDomainId)> {
    let Some(def) = fusion.definition(consumer) else { return Vec::new() };
    let expr = fusion.expr(def);
    if !expr.inputs().contains(&producer) {
        return Vec::new();
    }
    let producer_axes = fusion.non_reduction_root(producer);
    let consumer_root = fusion.tv(consumer).domain().root();
    let consumer_axes: Vec<IterDomainId> = match expr.kind() {
        ExprKind::Broadcast { is_broadcast_dim } => consumer_root
            .iter()
            .zip(is_broadcast_dim)
            .filter(|&(_, &new_axis)| !new_axis)
            .map(|(&id, _)| id)
            .collect(),
        _ => consumer_root.to_vec(),
    };
    producer_axes.into_iter().zip(consumer_axes).collect()
}

/// Whole-fusion equivalence of root axes for inlining.
///
/// Concrete axes related by any expression share a class. A broadcast axis
/// is only recorded as resolved by the concrete axes it meets; it maps to a
/// concrete class when every resolution agrees on one class, so an
/// ambiguous fan-out stays unmapped. Reduction axes never map into tensors
/// computed from the reduction's result.
#[derive(Debug, Clone)]
pub struct ComputeAtRootDomainMap {
    sets: DisjointSets<IterDomainId>,
    broadcast: HashSet<IterDomainId>,
    resolutions: HashMap<IterDomainId, Vec<IterDomainId>>,
    reduction_owner: HashMap<IterDomainId, ValId>,
    downstream: HashMap<ValId, HashSet<ValId>>,
}

impl ComputeAtRootDomainMap {
    pub fn build(fusion: &Fusion) -> Self {
        let mut map = Self {
            sets: DisjointSets::new(),
            broadcast: HashSet::new(),
            resolutions: HashMap::new(),
            reduction_owner: HashMap::new(),
            downstream: HashMap::new(),
        };

        for tv in fusion.all_tensors() {
            let domain = fusion.tv(tv).domain();
            for &id in domain.root().iter().chain(domain.maybe_rfactor()) {
                map.sets.insert(id);
                if fusion.id(id).is_broadcast() {
                    map.broadcast.insert(id);
                }
            }
        }

        for e in fusion.tensor_exprs() {
            let expr = fusion.expr(e);
            for (&consumer, &producer) in expr.outputs().iter().cartesian_product(expr.inputs()) {
                if !fusion.is_tensor(producer) || !fusion.is_tensor(consumer) {
                    continue;
                }
                for (p, c) in pairwise_root_pairs(fusion, producer, consumer) {
                    match (map.broadcast.contains(&p), map.broadcast.contains(&c)) {
                        (true, false) => map.resolutions.entry(p).or_default().push(c),
                        (false, true) => map.resolutions.entry(c).or_default().push(p),
                        _ => map.sets.union(p, c),
                    }
                }
            }
        }

        for tv in fusion.all_tensors() {
            if !fusion.is_reduction_tv(tv) && !fusion.tv(tv).domain().has_rfactor() {
                continue;
            }
            let domain = fusion.tv(tv).domain();
            let reductions: Vec<IterDomainId> = domain
                .root()
                .iter()
                .chain(domain.maybe_rfactor())
                .copied()
                .filter(|&id| fusion.id(id).is_reduction())
                .collect();
            if reductions.is_empty() {
                continue;
            }
            for id in reductions {
                map.reduction_owner.insert(id, tv);
            }
            map.downstream.insert(tv, downstream_of(fusion, tv));
        }

        debug!(
            classes = map.sets.classes().len(),
            broadcasts = map.broadcast.len(),
            reductions = map.reduction_owner.len(),
            "built compute-at root map"
        );
        map
    }

    /// Whether root axis `id_a` of `tv_a` and `id_b` of `tv_b` are provably
    /// of equal extent in a way that permits inlining.
    pub fn can_map(&self, tv_a: ValId, id_a: IterDomainId, tv_b: ValId, id_b: IterDomainId) -> bool {
        if id_a == id_b {
            return true;
        }
        if self.crosses_reduction(id_a, tv_b) || self.crosses_reduction(id_b, tv_a) {
            return false;
        }
        match (self.broadcast.contains(&id_a), self.broadcast.contains(&id_b)) {
            (false, false) => self.sets.same(id_a, id_b),
            (true, false) => self.resolved_class(id_a) == Some(self.sets.find(id_b)),
            (false, true) => self.resolved_class(id_b) == Some(self.sets.find(id_a)),
            (true, true) => {
                self.sets.same(id_a, id_b)
                    || self.resolved_class(id_a).is_some_and(|class| self.resolved_class(id_b) == Some(class))
            }
        }
    }

    /// Pairwise pairs of a direct producer/consumer edge that can be mapped.
    pub fn mappable_pairs(
        &self,
        fusion: &Fusion,
        producer: ValId,
        consumer: ValId,
    ) -> Vec<(IterDomainId, IterDomainId)> {
        pairwise_root_pairs(fusion, producer, consumer)
            .into_iter()
            .filter(|&(p, c)| self.can_map(producer, p, consumer, c))
            .collect()
    }

    fn crosses_reduction(&self, id: IterDomainId, other: ValId) -> bool {
        let Some(&owner) = self.reduction_owner.get(&id) else { return false };
        owner != other && self.downstream.get(&owner).is_some_and(|set| set.contains(&other))
    }

    /// The single concrete class every broadcast of `id`'s class resolves to.
    fn resolved_class(&self, id: IterDomainId) -> Option<IterDomainId> {
        let mut class = None;
        for member in self.sets.members(id) {
            for &concrete in self.resolutions.get(&member).into_iter().flatten() {
                let root = self.sets.find(concrete);
                match class {
                    None => class = Some(root),
                    Some(existing) if existing == root => {}
                    Some(_) => return None,
                }
            }
        }
        class
    }
}

/// Tensors transitively computed from `tv`, excluding `tv` itself.
fn downstream_of(fusion: &Fusion, tv: ValId) -> HashSet<ValId> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<ValId> = fusion.consumer_tvs(tv).into();
    while let Some(v) = queue.pop_front() {
        if seen.insert(v) {
            queue.extend(fusion.consumer_tvs(v));
        }
    }
    seen
}
