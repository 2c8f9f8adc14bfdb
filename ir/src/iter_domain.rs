use smallvec::{SmallVec, smallvec};

use crate::ids::{IterDomainId, ValId};
use crate::types::{IterType, ParallelType};
use crate::TransformId;

/// One axis of a tensor's iteration space.
///
/// Iteration domains are created once and never mutated structurally;
/// transforms create new domains and record themselves as their definition.
/// Only the parallel binding can change after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct IterDomain {
    pub start: ValId,
    pub extent: ValId,
    pub iter_type: IterType,
    pub parallel_type: ParallelType,
    /// Created by an rfactor (a reduction axis turned into an iteration of the partial tensor).
    pub is_rfactor: bool,
    pub definition: Option<TransformId>,
}

impl IterDomain {
    pub fn new(start: ValId, extent: ValId, iter_type: IterType) -> Self {
        Self { start, extent, iter_type, parallel_type: ParallelType::Serial, is_rfactor: false, definition: None }
    }

    pub fn is_reduction(&self) -> bool {
        self.iter_type == IterType::Reduction
    }

    pub fn is_broadcast(&self) -> bool {
        self.iter_type == IterType::Broadcast
    }

    pub fn is_iteration(&self) -> bool {
        self.iter_type == IterType::Iteration
    }

    pub fn is_parallelized(&self) -> bool {
        self.parallel_type != ParallelType::Serial
    }

    /// Bound to a block or thread index.
    pub fn is_launch_parallel(&self) -> bool {
        self.parallel_type.is_launch_dim()
    }
}

/// A recorded transformation between iteration domains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdTransform {
    /// `input` becomes `(outer, inner)`. With `inner_split` the factor is the
    /// inner extent, otherwise it is the outer extent.
    Split { input: IterDomainId, outer: IterDomainId, inner: IterDomainId, factor: ValId, inner_split: bool },
    /// `(outer, inner)` become one axis of product extent.
    Merge { outer: IterDomainId, inner: IterDomainId, output: IterDomainId },
}

impl IdTransform {
    pub fn inputs(&self) -> SmallVec<[IterDomainId; 2]> {
        match *self {
            IdTransform::Split { input, .. } => smallvec![input],
            IdTransform::Merge { outer, inner, .. } => smallvec![outer, inner],
        }
    }

    pub fn outputs(&self) -> SmallVec<[IterDomainId; 2]> {
        match *self {
            IdTransform::Split { outer, inner, .. } => smallvec![outer, inner],
            IdTransform::Merge { output, .. } => smallvec![output],
        }
    }
}
