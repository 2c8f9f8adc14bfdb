//! Index arithmetic for tensor accesses.
//!
//! A consumer's leaf indices are the indices of its enclosing loops. They
//! are propagated backward through its transforms to root indices, using
//! loop-group extents so a loop over a concrete axis indexes a broadcast
//! producer correctly. Global tensors are addressed through their root
//! strides. A producer in registers or shared memory is addressed in its
//! own allocation: consumer root indices cross to producer roots, replay
//! forward through the producer's transforms, and index the allocated
//! leaves, taking the loop index wherever the leaf shares a loop.

use std::collections::HashMap;

use fuser_ir::{Fusion, IdTransform, IterDomainId, MemoryType, ParallelType, ValId};
use fuser_schedule::PairwiseRootDomainMap;
use snafu::OptionExt;

use crate::compute_at_map::ComputeAtMap;
use crate::error::*;
use crate::kir::{LoopId, Scalar};
use crate::utils::{lower_val, own_extent};

/// One enclosing loop during code generation.
#[derive(Debug, Clone)]
pub struct LoopFrame {
    pub class: IterDomainId,
    pub index: Scalar,
    pub extent: Scalar,
    pub parallel: ParallelType,
    /// `None` for broadcast groups and launch-bound groups.
    pub loop_id: Option<LoopId>,
}

/// Storage of a tensor once lowering has settled it.
pub fn memory_of(fusion: &Fusion, tv: ValId) -> MemoryType {
    if fusion.is_input(tv) || fusion.is_output(tv) { MemoryType::Global } else { fusion.tv(tv).memory_type() }
}

pub struct Indexer<'a> {
    fusion: &'a Fusion,
    ca_map: &'a ComputeAtMap,
}

impl<'a> Indexer<'a> {
    pub fn new(fusion: &'a Fusion, ca_map: &'a ComputeAtMap) -> Self {
        Self { fusion, ca_map }
    }

    pub fn concrete_extent(&self, id: IterDomainId) -> Scalar {
        lower_val(self.fusion, self.ca_map.concrete_extent(self.fusion, id))
    }

    fn loop_index(&self, loops: &[LoopFrame], id: IterDomainId) -> Option<Scalar> {
        let class = self.ca_map.class(id);
        loops.iter().rev().find(|f| f.class == class).map(|f| f.index.clone())
    }

    /// Index of every leaf of `tv` inside `loops`.
    pub fn leaf_indices(&self, tv: ValId, loops: &[LoopFrame]) -> Result<HashMap<IterDomainId, Scalar>> {
        let mut indices = HashMap::new();
        for &leaf in self.fusion.tv(tv).domain().leaf() {
            let index = match self.loop_index(loops, leaf) {
                Some(index) => index,
                None if self.fusion.id(leaf).is_broadcast() || self.ca_map.is_broadcast(self.fusion, leaf) => Scalar::ZERO,
                None => return IndexUnavailableSnafu { tv, id: leaf }.fail(),
            };
            indices.insert(leaf, index);
        }
        Ok(indices)
    }

    /// Propagate leaf indices of `tv` back to every id of its history.
    pub fn backward(&self, tv: ValId, mut indices: HashMap<IterDomainId, Scalar>) -> HashMap<IterDomainId, Scalar> {
        for t in self.fusion.history(tv).into_iter().rev() {
            match *self.fusion.transform(t) {
                IdTransform::Split { input, outer, inner, .. } => {
                    if let (Some(o), Some(i)) = (indices.get(&outer), indices.get(&inner)) {
                        let index = o.clone().mul(self.concrete_extent(inner)).add(i.clone());
                        indices.insert(input, index);
                    }
                }
                IdTransform::Merge { outer, inner, output } => {
                    if let Some(x) = indices.get(&output).cloned() {
                        let inner_extent = self.concrete_extent(inner);
                        indices.insert(outer, x.clone().div(inner_extent.clone()));
                        indices.insert(inner, x.rem(inner_extent));
                    }
                }
            }
        }
        for &root in self.fusion.tv(tv).domain().root() {
            if self.fusion.id(root).is_broadcast() {
                indices.insert(root, Scalar::ZERO);
            }
        }
        indices
    }

    /// Index of every id of `tv`'s history as computed inside `loops`.
    pub fn consumer_indices(&self, tv: ValId, loops: &[LoopFrame]) -> Result<HashMap<IterDomainId, Scalar>> {
        Ok(self.backward(tv, self.leaf_indices(tv, loops)?))
    }

    /// Leaves of a register or shared tensor that its allocation spans.
    ///
    /// Loops outside the compute-at position are shared with the consumer
    /// and not allocated. Registers never span launch-bound axes; shared
    /// memory spans thread-bound axes wherever they are.
    pub fn allocated_leaves(&self, tv: ValId) -> Vec<IterDomainId> {
        let memory = memory_of(self.fusion, tv);
        let ca = self.fusion.tv(tv).compute_at_position();
        self.fusion
            .tv(tv)
            .domain()
            .leaf()
            .iter()
            .enumerate()
            .filter(|&(i, &id)| {
                let axis = self.fusion.id(id);
                if axis.is_reduction() || axis.is_broadcast() {
                    return false;
                }
                let pt = self.ca_map.parallel_type(id);
                match memory {
                    MemoryType::Local => i >= ca && !pt.is_launch_dim(),
                    MemoryType::Shared => pt.is_thread_dim() || (i >= ca && !pt.is_block_dim()),
                    MemoryType::Global => false,
                }
            })
            .map(|(_, &id)| id)
            .collect()
    }

    /// Elements of a register or shared allocation.
    pub fn allocation_size(&self, tv: ValId) -> Scalar {
        self.allocated_leaves(tv).into_iter().fold(Scalar::ONE, |acc, id| acc.mul(self.concrete_extent(id)))
    }

    /// Extents of the global layout: the non-reduction root axes.
    pub fn global_sizes(&self, tv: ValId) -> Vec<Scalar> {
        self.fusion
            .non_reduction_root(tv)
            .into_iter()
            .map(|id| if self.fusion.id(id).is_broadcast() { Scalar::ONE } else { own_extent(self.fusion, id) })
            .collect()
    }

    fn allocation_index(&self, tv: ValId, leaf: &HashMap<IterDomainId, Scalar>) -> Result<Scalar> {
        let allocated = self.allocated_leaves(tv);
        let mut index = Scalar::ZERO;
        let mut stride = Scalar::ONE;
        for &id in allocated.iter().rev() {
            let i = leaf.get(&id).cloned().context(IndexUnavailableSnafu { tv, id })?;
            index = i.mul(stride.clone()).add(index);
            stride = stride.mul(self.concrete_extent(id));
        }
        Ok(index)
    }

    fn global_index(&self, tv: ValId, root: &HashMap<IterDomainId, Scalar>) -> Result<Scalar> {
        let mut index = Scalar::ZERO;
        for (dim, id) in self.fusion.non_reduction_root(tv).into_iter().enumerate() {
            if self.fusion.id(id).is_broadcast() {
                continue;
            }
            let i = root.get(&id).cloned().context(IndexUnavailableSnafu { tv, id })?;
            index = index.add(i.mul(Scalar::TensorStride { tensor: tv, dim }));
        }
        Ok(index)
    }

    /// Where `tv` is written inside `loops`.
    pub fn consumer_index(&self, tv: ValId, loops: &[LoopFrame]) -> Result<Scalar> {
        match memory_of(self.fusion, tv) {
            MemoryType::Global => self.global_index(tv, &self.consumer_indices(tv, loops)?),
            _ => self.allocation_index(tv, &self.leaf_indices(tv, loops)?),
        }
    }

    /// Where `consumer`'s expression reads `producer` inside `loops`.
    pub fn producer_index(&self, producer: ValId, consumer: ValId, loops: &[LoopFrame]) -> Result<Scalar> {
        let consumer_root = self.consumer_indices(consumer, loops)?;
        let root_map = PairwiseRootDomainMap::new(self.fusion, producer, consumer)?;
        let mut indices: HashMap<IterDomainId, Scalar> = HashMap::new();
        for &(p, c) in root_map.pairs() {
            let index = if self.fusion.id(p).is_broadcast() {
                Scalar::ZERO
            } else {
                consumer_root.get(&c).cloned().context(IndexUnavailableSnafu { tv: consumer, id: c })?
            };
            indices.insert(p, index);
        }
        if memory_of(self.fusion, producer) == MemoryType::Global {
            return self.global_index(producer, &indices);
        }

        let domain = self.fusion.tv(producer).domain();
        for t in self.fusion.transforms_between(domain.maybe_rfactor(), domain.leaf()) {
            match *self.fusion.transform(t) {
                IdTransform::Split { input, outer, inner, .. } => {
                    let Some(x) = indices.get(&input).cloned() else { continue };
                    let inner_extent = own_extent(self.fusion, inner);
                    indices.insert(outer, x.clone().div(inner_extent.clone()));
                    indices.insert(inner, x.rem(inner_extent));
                }
                IdTransform::Merge { outer, inner, output } => {
                    let known = |id: IterDomainId| {
                        indices.get(&id).cloned().or_else(|| self.fusion.id(id).is_broadcast().then_some(Scalar::ZERO))
                    };
                    if let (Some(o), Some(i)) = (known(outer), known(inner)) {
                        indices.insert(output, o.mul(own_extent(self.fusion, inner)).add(i));
                    }
                }
            }
        }
        for &leaf in domain.leaf() {
            if self.fusion.id(leaf).is_broadcast() {
                continue;
            }
            if let Some(index) = self.loop_index(loops, leaf) {
                indices.insert(leaf, index);
            }
        }
        self.allocation_index(producer, &indices)
    }
}
