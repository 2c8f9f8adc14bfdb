//! Guards on element operations.
//!
//! An operation is guarded by three kinds of condition: bounds on the root
//! indices it touches, bounds on launch indices whose dimension is larger
//! than the loop bound to it, and index-zero conditions on launch types
//! along which the value is only valid, or only needs writing, once.
//! Bounds are dropped where the loop structure already proves them.

use std::collections::HashMap;

use fuser_ir::{Fusion, IterDomainId, MemoryType, ParallelTypeSet, ValId, const_int};

use crate::compute_at_map::ComputeAtMap;
use crate::index::{Indexer, memory_of};
use crate::kir::Scalar;
use crate::parallel_dims::ParallelDimensionMap;
use crate::thread_predicate::ThreadPredicateMap;
use crate::utils::own_extent;

pub struct PredicateBuilder<'a> {
    fusion: &'a Fusion,
    ca_map: &'a ComputeAtMap,
    pdims: &'a ParallelDimensionMap,
    indexer: &'a Indexer<'a>,
}

impl<'a> PredicateBuilder<'a> {
    pub fn new(fusion: &'a Fusion, ca_map: &'a ComputeAtMap, pdims: &'a ParallelDimensionMap, indexer: &'a Indexer<'a>) -> Self {
        Self { fusion, ca_map, pdims, indexer }
    }

    /// Whether every index derived from `root` provably stays inside it.
    ///
    /// Holds when `root` is only merged or split by constant factors that
    /// divide constant extents, and every loop over a derived leaf runs
    /// exactly the leaf's own extent.
    pub fn is_exact_root(&self, tv: ValId, root: IterDomainId) -> bool {
        let fusion = self.fusion;
        let history = fusion.history(tv);
        let mut uses: HashMap<IterDomainId, usize> = HashMap::new();
        for (i, &t) in history.iter().enumerate() {
            for input in fusion.transform(t).inputs() {
                uses.insert(input, i);
            }
        }
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match uses.get(&id) {
                Some(&i) => {
                    let transform = *fusion.transform(history[i]);
                    if let fuser_ir::IdTransform::Split { input, factor, .. } = transform {
                        let divisible = match (const_int(fusion, fusion.extent(input)), const_int(fusion, factor)) {
                            (Some(extent), Some(factor)) => factor > 0 && extent % factor == 0,
                            _ => false,
                        };
                        if !divisible {
                            return false;
                        }
                    }
                    stack.extend(transform.outputs());
                }
                None => {
                    if self.indexer.concrete_extent(id) != own_extent(fusion, id) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Root bounds for `tv`. Reads cover every root axis, reductions
    /// included; writes only the axes of the stored value.
    pub fn bounds(&self, tv: ValId, indices: &HashMap<IterDomainId, Scalar>, include_reduction: bool) -> Scalar {
        let fusion = self.fusion;
        let roots: Vec<IterDomainId> =
            if include_reduction { fusion.tv(tv).domain().root().to_vec() } else { fusion.non_reduction_root(tv) };
        Scalar::all(roots.into_iter().filter_map(|root| {
            if fusion.id(root).is_broadcast() || self.is_exact_root(tv, root) {
                return None;
            }
            let index = indices.get(&root)?.clone();
            Some(index.lt(own_extent(fusion, root)))
        }))
    }

    /// `pt < extent` for every leaf bound to a launch type that launches wider.
    pub fn parallel_bounds(&self, tv: ValId, include_reduction: bool) -> Scalar {
        let fusion = self.fusion;
        Scalar::all(fusion.tv(tv).domain().leaf().iter().filter_map(|&leaf| {
            let axis = fusion.id(leaf);
            let pt = self.ca_map.parallel_type(leaf);
            if axis.is_broadcast() || (axis.is_reduction() && !include_reduction) || !pt.is_launch_dim() || self.pdims.is_exact(pt) {
                return None;
            }
            Some(Scalar::ParallelIndex(pt).lt(self.indexer.concrete_extent(leaf)))
        }))
    }

    /// Launch types a write to `tv` does not depend on.
    ///
    /// Every thread along such a type would store the same element of a
    /// global or shared tensor; only index zero does.
    pub fn redundant_types(&self, tv: ValId, skip_reduction: bool) -> ParallelTypeSet {
        if memory_of(self.fusion, tv) == MemoryType::Local {
            return ParallelTypeSet::empty();
        }
        let used: ParallelTypeSet = self
            .fusion
            .tv(tv)
            .domain()
            .leaf()
            .iter()
            .filter(|&&leaf| {
                let axis = self.fusion.id(leaf);
                !axis.is_broadcast() && !(skip_reduction && axis.is_reduction())
            })
            .map(|&leaf| self.ca_map.parallel_type(leaf))
            .filter(|pt| pt.is_launch_dim())
            .collect();
        self.pdims.types() - used
    }

    pub fn thread_predicate(types: ParallelTypeSet) -> Scalar {
        ThreadPredicateMap::predicate(types)
    }
}
