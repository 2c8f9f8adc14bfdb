//! Launch dimensions of a kernel.
//!
//! Every loop group bound to a block or thread type contributes its extent
//! to that type. A type whose groups all have the same extent is exact and
//! launches with that extent; otherwise it launches with the largest one and
//! every loop over it is predicated on its own extent.

use std::collections::BTreeMap;
use std::fmt;

use fuser_ir::{Fusion, ParallelType, ParallelTypeSet};

use crate::compute_at_map::ComputeAtMap;
use crate::kir::Scalar;
use crate::utils::lower_val;

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelDim {
    /// Distinct extents of the groups bound to this type.
    pub extents: Vec<Scalar>,
}

impl ParallelDim {
    pub fn is_exact(&self) -> bool {
        self.extents.len() == 1
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParallelDimensionMap {
    dims: BTreeMap<ParallelType, ParallelDim>,
}

impl ParallelDimensionMap {
    pub fn build(fusion: &Fusion, ca_map: &ComputeAtMap) -> Self {
        let mut dims: BTreeMap<ParallelType, ParallelDim> = BTreeMap::new();
        for class in ca_map.classes() {
            let pt = ca_map.parallel_type(class);
            if !pt.is_launch_dim() || ca_map.is_broadcast(fusion, class) {
                continue;
            }
            let extent = lower_val(fusion, ca_map.concrete_extent(fusion, class));
            let dim = dims.entry(pt).or_insert_with(|| ParallelDim { extents: Vec::new() });
            if !dim.extents.contains(&extent) {
                dim.extents.push(extent);
            }
        }
        Self { dims }
    }

    pub fn get(&self, pt: ParallelType) -> Option<&ParallelDim> {
        self.dims.get(&pt)
    }

    pub fn is_exact(&self, pt: ParallelType) -> bool {
        self.dims.get(&pt).is_some_and(ParallelDim::is_exact)
    }

    /// Launch value of `pt` as kernel code sees it: the common extent when
    /// exact, the launch builtin otherwise, and one when unused.
    pub fn extent(&self, pt: ParallelType) -> Scalar {
        match self.dims.get(&pt) {
            Some(dim) if dim.is_exact() => dim.extents[0].clone(),
            Some(_) => Scalar::ParallelDim(pt),
            None => Scalar::ONE,
        }
    }

    /// Launch types in use.
    pub fn types(&self) -> ParallelTypeSet {
        self.dims.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParallelType, &ParallelDim)> {
        self.dims.iter().map(|(&pt, dim)| (pt, dim))
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }
}

impl fmt::Display for ParallelDimensionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pt, dim) in &self.dims {
            let extents: Vec<String> = dim.extents.iter().map(ToString::to_string).collect();
            let kind = if dim.is_exact() { "exact" } else { "non-exact" };
            writeln!(f, "{pt}: {} ({kind})", extents.join(", "))?;
        }
        Ok(())
    }
}
