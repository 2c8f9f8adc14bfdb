use crate::ids::IterDomainId;
use crate::types::MemoryType;

/// The three logical domains of a tensor plus per-root contiguity.
///
/// `root` is the original shape, `rfactor` (when present) the intermediate
/// domain left by an rfactor, `leaf` the current schedule. Every leaf can be
/// traced back to the root through the recorded transforms.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDomain {
    root: Vec<IterDomainId>,
    rfactor: Option<Vec<IterDomainId>>,
    leaf: Vec<IterDomainId>,
    contiguity: Vec<bool>,
}

impl TensorDomain {
    pub fn new(root: Vec<IterDomainId>, contiguity: Vec<bool>) -> Self {
        debug_assert_eq!(root.len(), contiguity.len());
        Self { leaf: root.clone(), root, rfactor: None, contiguity }
    }

    pub fn contiguous(root: Vec<IterDomainId>) -> Self {
        let contiguity = vec![true; root.len()];
        Self::new(root, contiguity)
    }

    pub fn with_rfactor(root: Vec<IterDomainId>, rfactor: Vec<IterDomainId>, leaf: Vec<IterDomainId>) -> Self {
        let contiguity = vec![true; root.len()];
        Self { root, rfactor: Some(rfactor), leaf, contiguity }
    }

    pub fn root(&self) -> &[IterDomainId] {
        &self.root
    }

    pub fn rfactor(&self) -> Option<&[IterDomainId]> {
        self.rfactor.as_deref()
    }

    pub fn has_rfactor(&self) -> bool {
        self.rfactor.is_some()
    }

    /// The rfactor domain if there is one, otherwise the root.
    ///
    /// Consumers see this domain of their producers.
    pub fn maybe_rfactor(&self) -> &[IterDomainId] {
        self.rfactor.as_deref().unwrap_or(&self.root)
    }

    pub fn leaf(&self) -> &[IterDomainId] {
        &self.leaf
    }

    pub fn n_dims(&self) -> usize {
        self.leaf.len()
    }

    pub fn axis(&self, i: usize) -> IterDomainId {
        self.leaf[i]
    }

    pub fn contiguity(&self) -> &[bool] {
        &self.contiguity
    }

    pub fn position_of(&self, id: IterDomainId) -> Option<usize> {
        self.leaf.iter().position(|&leaf| leaf == id)
    }

    pub fn set_leaf(&mut self, leaf: Vec<IterDomainId>) {
        self.leaf = leaf;
    }

    pub fn set_contiguity(&mut self, contiguity: Vec<bool>) {
        debug_assert_eq!(self.root.len(), contiguity.len());
        self.contiguity = contiguity;
    }
}

/// A tensor-valued node: math identity plus its own iteration schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorView {
    domain: TensorDomain,
    memory_type: MemoryType,
    compute_at_pos: usize,
    max_producer_pos: usize,
}

impl TensorView {
    pub fn new(domain: TensorDomain) -> Self {
        Self { domain, memory_type: MemoryType::Local, compute_at_pos: 0, max_producer_pos: 0 }
    }

    pub fn domain(&self) -> &TensorDomain {
        &self.domain
    }

    pub fn domain_mut(&mut self) -> &mut TensorDomain {
        &mut self.domain
    }

    pub fn set_domain(&mut self, domain: TensorDomain) {
        self.domain = domain;
    }

    pub fn n_dims(&self) -> usize {
        self.domain.n_dims()
    }

    pub fn axis(&self, i: usize) -> IterDomainId {
        self.domain.axis(i)
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn set_memory_type(&mut self, memory_type: MemoryType) {
        self.memory_type = memory_type;
    }

    /// Number of leading leaf axes inlined into the consumer.
    pub fn compute_at_position(&self) -> usize {
        self.compute_at_pos
    }

    /// Deepest axis at which some producer is inlined into this tensor.
    pub fn max_producer_position(&self) -> usize {
        self.max_producer_pos
    }

    /// Leaf axes that can no longer be transformed.
    pub fn fixed_position(&self) -> usize {
        self.compute_at_pos.max(self.max_producer_pos)
    }

    /// Positions only ever grow.
    pub fn set_compute_at_position(&mut self, pos: usize) {
        self.compute_at_pos = self.compute_at_pos.max(pos);
    }

    pub fn set_max_producer_position(&mut self, pos: usize) {
        self.max_producer_pos = self.max_producer_pos.max(pos);
    }

    /// Copy positions and memory type from another view, used for sibling outputs.
    pub fn copy_schedule_state(&mut self, other: &TensorView) {
        self.domain = other.domain.clone();
        self.memory_type = other.memory_type;
        self.compute_at_pos = other.compute_at_pos;
        self.max_producer_pos = other.max_producer_pos;
    }
}
