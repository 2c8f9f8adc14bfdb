//! Loop groups of a scheduled fusion.
//!
//! Two iteration domains share a loop when a producer is computed at a
//! consumer and the domains correspond inside the compute-at position. The
//! ids they were derived from are grouped along with them, so index
//! arithmetic over either tensor sees the same extents. Each group has a
//! concrete member, preferring a non-broadcast one, whose extent is the trip
//! count of the loop, and at most one parallel binding.

use std::collections::{HashMap, HashSet};

use fuser_ir::{Fusion, IterDomainId, ParallelType, ValId};
use fuser_schedule::{DisjointSets, PairwiseRootDomainMap, best_effort_map};
use tracing::{debug, trace};

use crate::error::*;
use crate::utils::{ancestors, tensor_inputs};

#[derive(Debug, Clone)]
pub struct ComputeAtMap {
    sets: DisjointSets<IterDomainId>,
    concrete: HashMap<IterDomainId, IterDomainId>,
    parallel: HashMap<IterDomainId, ParallelType>,
}

impl ComputeAtMap {
    pub fn build(fusion: &Fusion) -> Result<Self> {
        let mut sets = DisjointSets::new();
        let tensors = fusion.all_tensors();
        for &tv in &tensors {
            let root = fusion.tv(tv).domain().root().to_vec();
            for id in fusion.ids_of_history(&root, &fusion.history(tv)) {
                sets.insert(id);
            }
        }

        for e in fusion.tensor_exprs() {
            let expr = fusion.expr(e);
            for producer in tensor_inputs(fusion, expr.inputs()) {
                let pos = fusion.tv(producer).compute_at_position();
                if pos == 0 {
                    continue;
                }
                for &consumer in expr.outputs() {
                    if !fusion.is_tensor(consumer) {
                        continue;
                    }
                    let root_map = PairwiseRootDomainMap::new(fusion, producer, consumer)?;
                    let map = best_effort_map(fusion, producer, consumer, root_map.pairs());
                    let consumer_leaf: HashSet<IterDomainId> = fusion.tv(consumer).domain().leaf().iter().copied().collect();
                    for axis in 0..pos {
                        let leaf = fusion.tv(producer).axis(axis);
                        let Some(&target) = map.get(&leaf).filter(|t| consumer_leaf.contains(t)) else {
                            return UnmappedComputeAtSnafu { producer, consumer, axis }.fail();
                        };
                        sets.union(leaf, target);
                        for ancestor in ancestors(fusion, leaf) {
                            if let Some(&image) = map.get(&ancestor) {
                                sets.union(ancestor, image);
                            }
                        }
                    }
                    trace!(%producer, %consumer, pos, "mapped compute-at loops");
                }
            }
        }

        let mut concrete = HashMap::new();
        let mut parallel = HashMap::new();
        for class in sets.classes() {
            let root = class[0];
            let pick = class.iter().copied().find(|&id| !fusion.id(id).is_broadcast()).unwrap_or(root);
            concrete.insert(root, pick);
            let mut bound = ParallelType::Serial;
            for &id in &class {
                let pt = fusion.id(id).parallel_type;
                if pt == ParallelType::Serial || pt == bound {
                    continue;
                }
                if bound != ParallelType::Serial {
                    return ParallelTypeConflictSnafu { id: root, first: bound, second: pt }.fail();
                }
                bound = pt;
            }
            parallel.insert(root, bound);
        }
        debug!(groups = concrete.len(), "built compute-at map");
        Ok(Self { sets, concrete, parallel })
    }

    /// Representative of the loop group of `id`.
    pub fn class(&self, id: IterDomainId) -> IterDomainId {
        self.sets.find(id)
    }

    pub fn same_loop(&self, a: IterDomainId, b: IterDomainId) -> bool {
        self.sets.same(a, b)
    }

    pub fn members(&self, id: IterDomainId) -> Vec<IterDomainId> {
        self.sets.members(id)
    }

    pub fn concrete(&self, id: IterDomainId) -> IterDomainId {
        self.concrete.get(&self.class(id)).copied().unwrap_or(id)
    }

    pub fn concrete_extent(&self, fusion: &Fusion, id: IterDomainId) -> ValId {
        fusion.extent(self.concrete(id))
    }

    pub fn parallel_type(&self, id: IterDomainId) -> ParallelType {
        self.parallel.get(&self.class(id)).copied().unwrap_or(ParallelType::Serial)
    }

    /// Every member is a broadcast; such groups get no loop.
    pub fn is_broadcast(&self, fusion: &Fusion, id: IterDomainId) -> bool {
        fusion.id(self.concrete(id)).is_broadcast()
    }

    /// Representatives of every group, sorted.
    pub fn classes(&self) -> Vec<IterDomainId> {
        let mut roots: Vec<IterDomainId> = self.concrete.keys().copied().collect();
        roots.sort();
        roots
    }
}
